//! Per-application view of the log used by the runtime.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use super::{LogRecord, LogStore, LogWriter, NewRecord, StoreError, StreamReplayer};
use crate::error::Result;

/// Reads go straight to the store, writes go through the single writer.
#[derive(Clone)]
pub struct AppLog {
    app_id: Arc<str>,
    store: Arc<dyn LogStore>,
    writer: LogWriter,
    replayer: StreamReplayer,
}

impl AppLog {
    pub fn new(
        app_id: impl Into<Arc<str>>,
        store: Arc<dyn LogStore>,
        writer: LogWriter,
        replayer: StreamReplayer,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            store,
            writer,
            replayer,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Latest row for `id`.
    pub async fn get(&self, id: &str) -> Result<Option<LogRecord>> {
        Ok(self.store.get(&self.app_id, id).await?)
    }

    /// Row following the latest row for `id`.
    pub async fn get_after(&self, id: &str) -> Result<Option<LogRecord>> {
        Ok(self.store.get_after(&self.app_id, id).await?)
    }

    /// Enqueue a record on the writer.
    pub fn set(&self, record: NewRecord) -> Result<()> {
        self.writer.set(record)
    }

    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    pub fn replay_stream(&self, stream_id: &str) -> mpsc::Receiver<Result<Value, StoreError>> {
        self.replayer.replay(stream_id)
    }

    pub fn writer(&self) -> &LogWriter {
        &self.writer
    }
}

impl std::fmt::Debug for AppLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppLog")
            .field("app_id", &self.app_id)
            .field("writer", &self.writer)
            .finish()
    }
}
