//! Single background writer for an application instance's log.
//!
//! Components never append to the store directly. They enqueue records on
//! an unbounded channel and one task drains it in order, so interleaved
//! writes from concurrently running components cannot race on position
//! assignment.
//!
//! ```text
//! component A ─┐
//! component B ─┼─► mpsc queue ─► writer loop ─► LogStore::append
//! component C ─┘                    │
//!                                   └─ storage fault ─► cancel app token
//! ```
//!
//! Stream chunks that are already queued back to back for the same stream
//! are coalesced into a single row. The row keeps the id of the first chunk
//! and stores the chunk payloads as a JSON array.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::{LogStore, NewRecord, RecordKind, StoreError};
use crate::error::{Result, SynxioError};

enum WriterCommand {
    Append(NewRecord),
    Flush(oneshot::Sender<()>),
}

/// Counters for observing writer behaviour.
#[derive(Debug, Default)]
pub struct WriterStats {
    records: AtomicU64,
    rows: AtomicU64,
}

impl WriterStats {
    /// Records accepted by the writer.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Acquire)
    }

    /// Rows appended to the store. Lower than `records` when chunks coalesce.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Acquire)
    }
}

/// Handle for enqueueing records on the background writer.
#[derive(Clone)]
pub struct LogWriter {
    sender: mpsc::UnboundedSender<WriterCommand>,
    stats: Arc<WriterStats>,
}

impl LogWriter {
    /// Spawn the writer task for `app_id`.
    ///
    /// `shutdown` is cancelled if the store fails. The task ends when every
    /// `LogWriter` clone has been dropped, after draining the queue.
    pub fn spawn(
        app_id: impl Into<String>,
        store: Arc<dyn LogStore>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(WriterStats::default());
        let writer_loop = WriterLoop {
            app_id: app_id.into(),
            store,
            receiver,
            shutdown,
            stats: stats.clone(),
        };
        let handle = tokio::spawn(writer_loop.run());
        (Self { sender, stats }, handle)
    }

    /// Enqueue a record. Never blocks.
    pub fn set(&self, record: NewRecord) -> Result<()> {
        self.sender
            .send(WriterCommand::Append(record))
            .map_err(|_| SynxioError::WriterClosed)
    }

    /// Wait until everything enqueued before this call is written.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WriterCommand::Flush(tx))
            .map_err(|_| SynxioError::WriterClosed)?;
        rx.await.map_err(|_| SynxioError::WriterClosed)
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("records", &self.stats.records())
            .field("rows", &self.stats.rows())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Writer Loop
// =============================================================================

struct PendingChunks {
    first_id: String,
    parent_id: String,
    payloads: Vec<Value>,
}

impl PendingChunks {
    fn into_record(self) -> NewRecord {
        NewRecord::chunk(self.first_id, self.parent_id, Value::Array(self.payloads))
    }
}

struct WriterLoop {
    app_id: String,
    store: Arc<dyn LogStore>,
    receiver: mpsc::UnboundedReceiver<WriterCommand>,
    shutdown: CancellationToken,
    stats: Arc<WriterStats>,
}

impl WriterLoop {
    async fn run(mut self) {
        info!(app_id = %self.app_id, "persistence writer starting");

        while let Some(command) = self.receiver.recv().await {
            let mut batch = vec![command];
            while let Ok(next) = self.receiver.try_recv() {
                batch.push(next);
            }

            if let Err(e) = self.write_batch(batch).await {
                error!(
                    app_id = %self.app_id,
                    error = %e,
                    "persistence write failed, tearing down application"
                );
                self.shutdown.cancel();
                break;
            }
        }

        info!(app_id = %self.app_id, "persistence writer stopped");
    }

    async fn write_batch(&self, batch: Vec<WriterCommand>) -> Result<(), StoreError> {
        let mut pending: Option<PendingChunks> = None;

        for command in batch {
            match command {
                WriterCommand::Append(record) if record.kind == RecordKind::StreamChunk => {
                    self.stats.records.fetch_add(1, Ordering::AcqRel);
                    let parent_id = record.parent_id.unwrap_or_default();
                    let payload = record.payload.unwrap_or(Value::Null);

                    if let Some(chunks) = pending.as_mut() {
                        if chunks.parent_id == parent_id {
                            chunks.payloads.push(payload);
                            continue;
                        }
                    }
                    if let Some(chunks) = pending.take() {
                        self.append(chunks.into_record()).await?;
                    }
                    pending = Some(PendingChunks {
                        first_id: record.id,
                        parent_id,
                        payloads: vec![payload],
                    });
                }
                WriterCommand::Append(record) => {
                    self.stats.records.fetch_add(1, Ordering::AcqRel);
                    if let Some(chunks) = pending.take() {
                        self.append(chunks.into_record()).await?;
                    }
                    self.append(record).await?;
                }
                WriterCommand::Flush(done) => {
                    if let Some(chunks) = pending.take() {
                        self.append(chunks.into_record()).await?;
                    }
                    let _ = done.send(());
                }
            }
        }

        if let Some(chunks) = pending.take() {
            self.append(chunks.into_record()).await?;
        }
        Ok(())
    }

    async fn append(&self, record: NewRecord) -> Result<(), StoreError> {
        let id = record.id.clone();
        let kind = record.kind;
        let position = self.store.append(&self.app_id, record).await?;
        self.stats.rows.fetch_add(1, Ordering::AcqRel);

        if kind == RecordKind::StreamChunk {
            trace!(app_id = %self.app_id, %id, %position, "stream chunk written");
        } else {
            debug!(app_id = %self.app_id, %id, %kind, %position, "record written");
        }
        Ok(())
    }
}
