//! Durable IO: memoizing side effects against the log.
//!
//! `run` records one `data` or `error` row per operation id. `run_with_events`
//! additionally writes a start marker, records each emitted event as a chunk
//! of the stream `{id}:stream`, closes it with a `streamDone` row, and only then records
//! the outcome. A present outcome row therefore implies a complete stream.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Result, SynxioError};
use crate::identity::{chunk_id, stream_id};
use crate::persistence::{AppLog, NewRecord, RecordKind};
use crate::registry::{DurableMark, Scope};

/// Run `op` unless an outcome for `id` is already recorded.
pub(crate) async fn run<T, F, Fut>(log: &AppLog, durable: &DurableMark, id: &str, op: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if let Some(outcome) = recorded(log, id).await? {
        durable.mark();
        debug!(io_id = %id, "durable operation replayed");
        return outcome;
    }

    let outcome = record(log, id, op().await)?;
    durable.mark();
    outcome
}

/// Run `op` with an event emitter, or replay its recorded events.
pub(crate) async fn run_with_events<E, T, F, Fut>(
    log: &AppLog,
    scope: &Scope,
    id: &str,
    op: F,
) -> Result<EventStream<E, T>>
where
    E: Serialize + DeserializeOwned + Send + 'static,
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(EventEmitter<E>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let stream = stream_id(id);

    if let Some(outcome) = recorded::<T>(log, id).await? {
        scope.durable.mark();
        debug!(io_id = %id, "event stream replayed");
        return Ok(EventStream {
            events: replayed_events(log, &stream),
            outcome: futures::future::ready(outcome).boxed(),
            replayed: true,
        });
    }

    log.set(NewRecord::stream_start(&stream))?;

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let emitter = EventEmitter {
        log: log.clone(),
        stream_id: stream.clone().into(),
        next: Arc::new(AtomicUsize::new(0)),
        durable: scope.durable.clone(),
        sender: event_tx,
    };

    let token = scope.token.clone();
    let durable = scope.durable.clone();
    let log = log.clone();
    let id = id.to_string();

    scope.tracker.spawn(async move {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(io_id = %id, "event stream cancelled");
                return;
            }
            result = op(emitter) => result,
        };

        let outcome = log
            .set(NewRecord::stream_done(stream))
            .and_then(|()| record(&log, &id, result))
            .and_then(|inner| inner);
        durable.mark();
        let _ = outcome_tx.send(outcome);
    });

    let events = async_stream::stream! {
        while let Some(event) = event_rx.recv().await {
            yield event;
        }
    };

    Ok(EventStream {
        events: events.boxed(),
        outcome: async move { outcome_rx.await.map_err(|_| SynxioError::Cancelled)? }.boxed(),
        replayed: false,
    })
}

/// Recorded outcome for `id`, if any.
async fn recorded<T: DeserializeOwned>(log: &AppLog, id: &str) -> Result<Option<Result<T>>> {
    let Some(row) = log.get(id).await? else {
        return Ok(None);
    };
    match row.kind {
        RecordKind::Data => {
            let value = serde_json::from_value(row.payload.unwrap_or(Value::Null))?;
            Ok(Some(Ok(value)))
        }
        RecordKind::Error => Ok(Some(Err(SynxioError::Io {
            id: id.to_string(),
            message: row.error_message().unwrap_or_default().to_string(),
        }))),
        RecordKind::StreamChunk | RecordKind::StreamDone => Ok(None),
    }
}

/// Enqueue the outcome row for `id`.
///
/// The outer result is a runtime fault; the inner one is the operation's.
fn record<T: Serialize>(log: &AppLog, id: &str, result: anyhow::Result<T>) -> Result<Result<T>> {
    match result {
        Ok(value) => {
            log.set(NewRecord::data(id, serde_json::to_value(&value)?))?;
            Ok(Ok(value))
        }
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(io_id = %id, error = %message, "durable operation failed");
            log.set(NewRecord::error(id, message.clone()))?;
            Ok(Err(SynxioError::Io {
                id: id.to_string(),
                message,
            }))
        }
    }
}

fn replayed_events<E>(log: &AppLog, stream: &str) -> BoxStream<'static, E>
where
    E: DeserializeOwned + Send + 'static,
{
    let mut chunks = log.replay_stream(stream);
    let stream = stream.to_string();

    async_stream::stream! {
        while let Some(chunk) = chunks.recv().await {
            match chunk {
                Ok(value) => match serde_json::from_value::<E>(value) {
                    Ok(event) => yield event,
                    Err(e) => warn!(stream_id = %stream, error = %e, "skipping unreadable stream chunk"),
                },
                Err(e) => {
                    warn!(stream_id = %stream, error = %e, "stream replay aborted");
                    break;
                }
            }
        }
    }
    .boxed()
}

/// Emits events from inside a [`ComponentContext::io_with_events`] operation.
///
/// [`ComponentContext::io_with_events`]: crate::ComponentContext::io_with_events
pub struct EventEmitter<E> {
    log: AppLog,
    stream_id: Arc<str>,
    next: Arc<AtomicUsize>,
    durable: Arc<DurableMark>,
    sender: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            stream_id: self.stream_id.clone(),
            next: self.next.clone(),
            durable: self.durable.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<E: Serialize> EventEmitter<E> {
    /// Record `event` as the next chunk and hand it to the live consumer.
    pub fn emit(&self, event: E) -> Result<()> {
        let n = self.next.fetch_add(1, Ordering::AcqRel);
        let payload = serde_json::to_value(&event)?;
        self.log
            .set(NewRecord::chunk(chunk_id(&self.stream_id, n), &*self.stream_id, payload))?;
        self.durable.mark();
        // The consumer may have stopped reading; the chunk is recorded anyway.
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("stream_id", &self.stream_id)
            .field("emitted", &self.next.load(Ordering::Acquire))
            .finish()
    }
}

/// Events of a durable operation plus its eventual outcome.
pub struct EventStream<E, T> {
    events: BoxStream<'static, E>,
    outcome: BoxFuture<'static, Result<T>>,
    replayed: bool,
}

impl<E, T> EventStream<E, T> {
    /// Next event, `None` once the operation has stopped emitting.
    pub async fn next(&mut self) -> Option<E> {
        self.events.next().await
    }

    pub fn events(&mut self) -> &mut BoxStream<'static, E> {
        &mut self.events
    }

    /// True if the events come from the log rather than a live run.
    pub fn is_replay(&self) -> bool {
        self.replayed
    }

    /// Outcome of the operation. Does not drain remaining events.
    pub async fn outcome(self) -> Result<T> {
        self.outcome.await
    }
}

impl<E, T> std::fmt::Debug for EventStream<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("replayed", &self.replayed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{LogStore, LogWriter, MemoryLogStore, StreamReplayer};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use tokio_util::sync::CancellationToken;

    fn app_log(store: &MemoryLogStore) -> AppLog {
        let store: Arc<dyn LogStore> = Arc::new(store.clone());
        let (writer, _) = LogWriter::spawn("app", store.clone(), CancellationToken::new());
        let replayer = StreamReplayer::new("app", store.clone());
        AppLog::new("app", store, writer, replayer)
    }

    #[tokio::test]
    async fn test_run_invokes_op_once() {
        let store = MemoryLogStore::new();
        let log = app_log(&store);
        let durable = DurableMark::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let first: Vec<String> = run(&log, &durable, "io:Root/x", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["a".to_string()])
        })
        .await
        .unwrap();
        log.flush().await.unwrap();

        let second: Vec<String> = run(&log, &durable, "io:Root/x", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["b".to_string()])
        })
        .await
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(durable.is_marked());
    }

    #[tokio::test]
    async fn test_failed_op_is_recorded_and_replayed() {
        let store = MemoryLogStore::new();
        let log = app_log(&store);
        let durable = DurableMark::default();

        let first: Result<u32> = run(&log, &durable, "io:Root/y", || async {
            Err(anyhow::anyhow!("rate limited").context("calling model"))
        })
        .await;
        log.flush().await.unwrap();

        let second: Result<u32> = run(&log, &durable, "io:Root/y", || async { Ok(7) }).await;

        for result in [first, second] {
            match result {
                Err(SynxioError::Io { id, message }) => {
                    assert_eq!(id, "io:Root/y");
                    assert_eq!(message, "calling model: rate limited");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        let rows = store.records("app");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, RecordKind::Error);
    }

    #[tokio::test]
    async fn test_event_stream_live_then_replayed() {
        let store = MemoryLogStore::new();
        let log = app_log(&store);
        let scope = Scope::root(CancellationToken::new());

        let mut live = run_with_events(&log, &scope, "io:Root/chat", |emit: EventEmitter<String>| async move {
            for word in ["hel", "lo", "!"] {
                emit.emit(word.to_string())?;
            }
            Ok(3usize)
        })
        .await
        .unwrap();

        assert!(!live.is_replay());
        let mut seen = Vec::new();
        while let Some(event) = live.next().await {
            seen.push(event);
        }
        assert_eq!(live.outcome().await.unwrap(), 3);
        assert_eq!(seen, vec!["hel", "lo", "!"]);
        log.flush().await.unwrap();

        let reran = Arc::new(AtomicBool::new(false));
        let flag = reran.clone();
        let mut replay = run_with_events(&log, &scope, "io:Root/chat", move |_emit: EventEmitter<String>| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(0usize)
        })
        .await
        .unwrap();

        assert!(replay.is_replay());
        let mut replayed = Vec::new();
        while let Some(event) = replay.next().await {
            replayed.push(event);
        }
        assert_eq!(replayed, seen);
        assert_eq!(replay.outcome().await.unwrap(), 3);
        assert!(!reran.load(Ordering::SeqCst));

        let kinds: Vec<_> = store.records("app").iter().map(|r| r.kind).collect();
        assert_eq!(kinds.last(), Some(&RecordKind::Data));
        assert!(kinds.contains(&RecordKind::StreamDone));
    }

    #[tokio::test]
    async fn test_rerun_after_interrupted_stream_replays_only_rerun() {
        let store = MemoryLogStore::new();
        let stream = "io:Root/chat:stream";
        // An earlier attempt got two chunks out before the process died.
        store.append("app", NewRecord::stream_start(stream)).await.unwrap();
        store
            .append("app", NewRecord::chunk(format!("{}[0]", stream), stream, json!(["stale-a"])))
            .await
            .unwrap();
        store
            .append("app", NewRecord::chunk(format!("{}[1]", stream), stream, json!(["stale-b"])))
            .await
            .unwrap();

        let log = app_log(&store);
        let scope = Scope::root(CancellationToken::new());

        let mut live = run_with_events(&log, &scope, "io:Root/chat", |_emit: EventEmitter<String>| async move {
            Ok(0usize)
        })
        .await
        .unwrap();
        assert!(!live.is_replay());
        assert_eq!(live.next().await, None);
        assert_eq!(live.outcome().await.unwrap(), 0);
        log.flush().await.unwrap();

        let mut replay = run_with_events(&log, &scope, "io:Root/chat", |_emit: EventEmitter<String>| async move {
            Ok(1usize)
        })
        .await
        .unwrap();
        assert!(replay.is_replay());
        assert_eq!(replay.next().await, None);
        assert_eq!(replay.outcome().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_stream_records_nothing() {
        let store = MemoryLogStore::new();
        let log = app_log(&store);
        let scope = Scope::root(CancellationToken::new());

        let stream = run_with_events(&log, &scope, "io:Root/slow", |_emit: EventEmitter<u8>| async move {
            futures::future::pending::<()>().await;
            Ok(())
        })
        .await
        .unwrap();

        scope.token.cancel();
        assert!(matches!(stream.outcome().await, Err(SynxioError::Cancelled)));
        log.flush().await.unwrap();
        let ids: Vec<String> = store.records("app").into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["io:Root/slow:stream:start".to_string()]);
    }
}
