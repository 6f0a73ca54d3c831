//! Replays the chunk history of a persisted event stream.
//!
//! A stream `S` was written as chunk rows with `parent_id == S` (ids
//! `S[0]`, `S[n]`, ...) followed by a `streamDone` row with id `S`. Rows of
//! other components may sit in between. Every live run first writes a start
//! marker `S:start`. The replayer starts at the latest marker and walks
//! forward by position, forwarding only the chunks of `S`, until it reaches
//! the terminal marker, so chunks left behind by an interrupted attempt are
//! never replayed. Logs without markers are walked from the latest `S[0]`.
//!
//! Each walk runs on its own driver task and feeds a bounded channel, so a
//! slow consumer applies backpressure to the walk instead of buffering the
//! whole history. Walks of the same stream are serialized by a per-stream
//! gate.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{LogStore, RecordKind, StoreError};
use crate::identity::{chunk_id, stream_start_id};

/// Default capacity of the per-walk channel.
pub const DEFAULT_REPLAY_BUFFER: usize = 1;

/// Drives replay walks for one application instance.
#[derive(Clone)]
pub struct StreamReplayer {
    app_id: Arc<str>,
    store: Arc<dyn LogStore>,
    gates: Arc<DashMap<String, Arc<Mutex<()>>>>,
    buffer: usize,
}

impl StreamReplayer {
    pub fn new(app_id: impl Into<Arc<str>>, store: Arc<dyn LogStore>) -> Self {
        Self::with_buffer(app_id, store, DEFAULT_REPLAY_BUFFER)
    }

    pub fn with_buffer(app_id: impl Into<Arc<str>>, store: Arc<dyn LogStore>, buffer: usize) -> Self {
        Self {
            app_id: app_id.into(),
            store,
            gates: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Start replaying `stream_id`. Chunk payloads arrive in log order; the
    /// channel closes after the terminal marker (or the end of the log).
    pub fn replay(&self, stream_id: &str) -> mpsc::Receiver<Result<Value, StoreError>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let gate = self
            .gates
            .entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let walker = Walker {
            app_id: self.app_id.clone(),
            store: self.store.clone(),
            stream_id: stream_id.to_string(),
            tx,
        };

        tokio::spawn(async move {
            let _permit = gate.lock().await;
            walker.run().await;
        });

        rx
    }
}

impl std::fmt::Debug for StreamReplayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReplayer")
            .field("app_id", &self.app_id)
            .field("streams", &self.gates.len())
            .finish()
    }
}

struct Walker {
    app_id: Arc<str>,
    store: Arc<dyn LogStore>,
    stream_id: String,
    tx: mpsc::Sender<Result<Value, StoreError>>,
}

impl Walker {
    async fn run(self) {
        match self.walk().await {
            Ok(count) => {
                debug!(app_id = %self.app_id, stream_id = %self.stream_id, count, "stream replayed");
            }
            Err(WalkError::ConsumerGone) => {}
            Err(WalkError::Store(e)) => {
                warn!(app_id = %self.app_id, stream_id = %self.stream_id, error = %e, "stream replay failed");
                let _ = self.tx.send(Err(e)).await;
            }
        }
    }

    async fn walk(&self) -> Result<usize, WalkError> {
        let mut count = 0;

        let start = stream_start_id(&self.stream_id);
        let mut cursor = match self.store.get(&self.app_id, &start).await? {
            Some(marker) => marker.position,
            None => {
                let first = chunk_id(&self.stream_id, 0);
                let Some(row) = self.store.get(&self.app_id, &first).await? else {
                    return Ok(count);
                };
                count += self.forward(row.chunk_values()).await?;
                row.position
            }
        };

        while let Some(row) = self.store.next_after(&self.app_id, cursor).await? {
            cursor = row.position;
            match row.kind {
                RecordKind::StreamChunk if row.parent_id.as_deref() == Some(self.stream_id.as_str()) => {
                    count += self.forward(row.chunk_values()).await?;
                }
                RecordKind::StreamDone if row.id == self.stream_id => break,
                _ => {}
            }
        }
        Ok(count)
    }

    async fn forward(&self, values: Vec<Value>) -> Result<usize, WalkError> {
        let n = values.len();
        for value in values {
            self.tx
                .send(Ok(value))
                .await
                .map_err(|_| WalkError::ConsumerGone)?;
        }
        Ok(n)
    }
}

enum WalkError {
    ConsumerGone,
    Store(StoreError),
}

impl From<StoreError> for WalkError {
    fn from(err: StoreError) -> Self {
        WalkError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryLogStore, NewRecord};
    use serde_json::json;

    async fn drain(mut rx: mpsc::Receiver<Result<Value, StoreError>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_replays_chunks_in_order_skipping_other_writers() {
        let store = MemoryLogStore::new();
        let s = "io:Root/gen:stream";
        store.append("app", NewRecord::chunk(format!("{}[0]", s), s, json!(["a", "b"]))).await.unwrap();
        store.append("app", NewRecord::data("io:Root/other", json!(1))).await.unwrap();
        store.append("app", NewRecord::chunk("io:X/y:stream[0]", "io:X/y:stream", json!(["zz"]))).await.unwrap();
        store.append("app", NewRecord::chunk(format!("{}[2]", s), s, json!(["c"]))).await.unwrap();
        store.append("app", NewRecord::stream_done(s)).await.unwrap();
        store.append("app", NewRecord::chunk("late", s, json!(["never"]))).await.unwrap();

        let replayer = StreamReplayer::new("app", Arc::new(store));
        let values = drain(replayer.replay(s)).await;

        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_stream_without_chunks_is_empty() {
        let store = MemoryLogStore::new();
        store.append("app", NewRecord::stream_done("s")).await.unwrap();

        let replayer = StreamReplayer::new("app", Arc::new(store));
        assert!(drain(replayer.replay("s")).await.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_after_crash_replays_latest_attempt() {
        let store = MemoryLogStore::new();
        // First attempt crashed mid-stream: no done marker.
        store.append("app", NewRecord::chunk("s[0]", "s", json!(["stale"]))).await.unwrap();
        // Second attempt.
        store.append("app", NewRecord::chunk("s[0]", "s", json!(["fresh"]))).await.unwrap();
        store.append("app", NewRecord::stream_done("s")).await.unwrap();

        let replayer = StreamReplayer::new("app", Arc::new(store));
        assert_eq!(drain(replayer.replay("s")).await, vec![json!("fresh")]);
    }

    #[tokio::test]
    async fn test_walk_starts_at_latest_start_marker() {
        let store = MemoryLogStore::new();
        // Interrupted attempt: marker and chunks, no done marker.
        store.append("app", NewRecord::stream_start("s")).await.unwrap();
        store.append("app", NewRecord::chunk("s[0]", "s", json!(["stale-a"]))).await.unwrap();
        store.append("app", NewRecord::chunk("s[1]", "s", json!(["stale-b"]))).await.unwrap();
        // Re-run that emitted nothing.
        store.append("app", NewRecord::stream_start("s")).await.unwrap();
        store.append("app", NewRecord::stream_done("s")).await.unwrap();

        let replayer = StreamReplayer::new("app", Arc::new(store));
        assert!(drain(replayer.replay("s")).await.is_empty());
    }

    #[tokio::test]
    async fn test_chunks_before_marker_are_ignored() {
        let store = MemoryLogStore::new();
        // Chunks written before any marker existed for this stream.
        store.append("app", NewRecord::chunk("s[0]", "s", json!(["old"]))).await.unwrap();
        store.append("app", NewRecord::stream_start("s")).await.unwrap();
        store.append("app", NewRecord::chunk("s[0]", "s", json!(["new"]))).await.unwrap();
        store.append("app", NewRecord::stream_done("s")).await.unwrap();

        let replayer = StreamReplayer::new("app", Arc::new(store));
        assert_eq!(drain(replayer.replay("s")).await, vec![json!("new")]);
    }

    #[tokio::test]
    async fn test_concurrent_walks_of_one_stream_both_complete() {
        let store = MemoryLogStore::new();
        for n in 0..5 {
            store
                .append("app", NewRecord::chunk(format!("s[{}]", n), "s", json!([n])))
                .await
                .unwrap();
        }
        store.append("app", NewRecord::stream_done("s")).await.unwrap();

        let replayer = StreamReplayer::new("app", Arc::new(store));
        let first = replayer.replay("s");
        let second = replayer.replay("s");

        let (a, b) = tokio::join!(drain(first), drain(second));
        assert_eq!(a, (0..5).map(|n| json!(n)).collect::<Vec<_>>());
        assert_eq!(a, b);
    }
}
