//! Append-only persistence log for application instances.
//!
//! # Overview
//!
//! Everything durable about an application instance is a row in one log:
//! the initial payload, the outcome of every durable operation, every chunk
//! of every event stream, and every resolved endpoint value. Component state
//! is NOT stored; it is rebuilt by replaying handlers against this log.
//!
//! # The Contract
//!
//! 1. **Append only.** Rows are never updated. Writing an id again appends a
//!    new row with a higher position; reads by id return the latest one.
//!
//! 2. **One writer.** Every append goes through [`LogWriter`], a single
//!    background task, so positions are assigned in enqueue order no matter
//!    how many components write concurrently.
//!
//! 3. **Walk by position.** [`LogStore::get_after`] returns the row right
//!    after an id's latest row. Stream replay is built on it.
//!
//! 4. **Storage faults are fatal.** A failed append tears the application
//!    instance down rather than leave a log that replays inconsistently.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::stream_start_id;

mod log;
mod memory;
mod replay;
#[cfg(feature = "sqlite")]
mod sqlite;
mod writer;

pub use log::AppLog;
pub use memory::MemoryLogStore;
pub use replay::{StreamReplayer, DEFAULT_REPLAY_BUFFER};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLogStore;
pub use writer::{LogWriter, WriterStats};

// =============================================================================
// Store Error
// =============================================================================

/// Errors from the log backend.
///
/// - [`StoreError::Backend`] means storage failed (connection, IO, locking).
/// - [`StoreError::Corrupt`] means a row exists but cannot be decoded.
///
/// Both are fatal to the application instance that hit them.
#[derive(Debug)]
pub enum StoreError {
    /// Storage backend failed.
    Backend(anyhow::Error),

    /// A stored row could not be decoded.
    Corrupt { id: String, reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "storage backend error: {}", e),
            StoreError::Corrupt { id, reason } => {
                write!(f, "corrupt log row {}: {}", id, reason)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(e) => Some(e.as_ref()),
            StoreError::Corrupt { .. } => None,
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Records
// =============================================================================

/// Kind of a log row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    /// Final value of an operation, endpoint, or the initial payload.
    Data,
    /// One or more coalesced chunks of an event stream.
    StreamChunk,
    /// End of an event stream.
    StreamDone,
    /// Persisted failure of a durable operation.
    Error,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Data => "data",
            RecordKind::StreamChunk => "streamChunk",
            RecordKind::StreamDone => "streamDone",
            RecordKind::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "data" => Some(RecordKind::Data),
            "streamChunk" => Some(RecordKind::StreamChunk),
            "streamDone" => Some(RecordKind::StreamDone),
            "error" => Some(RecordKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a row in an application instance's log.
///
/// Strictly increasing per app id. The first row is at position 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position(pub i64);

impl Position {
    /// Sentinel for an empty log.
    pub const NONE: Position = Position(0);

    pub fn next(self) -> Self {
        Position(self.0.saturating_add(1))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A row waiting to be appended. The writer assigns the position.
#[derive(Clone, Debug, PartialEq)]
pub struct NewRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: RecordKind,
    pub payload: Option<Value>,
}

impl NewRecord {
    pub fn data(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            kind: RecordKind::Data,
            payload: Some(payload),
        }
    }

    pub fn chunk(id: impl Into<String>, parent_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent_id.into()),
            kind: RecordKind::StreamChunk,
            payload: Some(payload),
        }
    }

    /// Marker written when a live run of `stream_id` begins.
    pub fn stream_start(stream_id: &str) -> Self {
        Self {
            id: stream_start_id(stream_id),
            parent_id: Some(stream_id.to_string()),
            kind: RecordKind::Data,
            payload: None,
        }
    }

    pub fn stream_done(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            kind: RecordKind::StreamDone,
            payload: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            kind: RecordKind::Error,
            payload: Some(serde_json::json!({ "message": message.into() })),
        }
    }
}

/// A row read back from the log.
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub app_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub position: Position,
    pub kind: RecordKind,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    pub(crate) fn from_new(app_id: &str, position: Position, record: NewRecord) -> Self {
        Self {
            app_id: app_id.to_string(),
            id: record.id,
            parent_id: record.parent_id,
            position,
            kind: record.kind,
            payload: record.payload,
            created_at: Utc::now(),
        }
    }

    /// Message of an `error` row.
    pub fn error_message(&self) -> Option<&str> {
        if self.kind != RecordKind::Error {
            return None;
        }
        self.payload
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(Value::as_str)
    }

    /// Chunk payloads of a `streamChunk` row, flattening coalesced rows.
    pub fn chunk_values(&self) -> Vec<Value> {
        match &self.payload {
            Some(Value::Array(values)) => values.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        }
    }
}

// =============================================================================
// Log Store
// =============================================================================

/// Storage backend for the persistence log.
///
/// Implementations only need single-row append ordering. Positions are
/// assigned by the caller's serialization (one [`LogWriter`] per app id).
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Append a row at the next position for `app_id`.
    async fn append(&self, app_id: &str, record: NewRecord) -> Result<Position, StoreError>;

    /// Latest row for `id`, or `None`.
    async fn get(&self, app_id: &str, id: &str) -> Result<Option<LogRecord>, StoreError>;

    /// The first row with a position greater than `position`.
    async fn next_after(
        &self,
        app_id: &str,
        position: Position,
    ) -> Result<Option<LogRecord>, StoreError>;

    /// The row immediately after the latest row for `id`.
    ///
    /// Returns `None` if `id` has no row or nothing follows it.
    async fn get_after(&self, app_id: &str, id: &str) -> Result<Option<LogRecord>, StoreError> {
        match self.get(app_id, id).await? {
            Some(row) => self.next_after(app_id, row.position).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<S: LogStore + ?Sized> LogStore for Arc<S> {
    async fn append(&self, app_id: &str, record: NewRecord) -> Result<Position, StoreError> {
        (**self).append(app_id, record).await
    }

    async fn get(&self, app_id: &str, id: &str) -> Result<Option<LogRecord>, StoreError> {
        (**self).get(app_id, id).await
    }

    async fn next_after(
        &self,
        app_id: &str,
        position: Position,
    ) -> Result<Option<LogRecord>, StoreError> {
        (**self).next_after(app_id, position).await
    }
}
