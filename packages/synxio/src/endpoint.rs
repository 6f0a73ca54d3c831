//! One-shot external input slots.
//!
//! An endpoint is identified by the hash of its path
//! (`endpoint:{componentPath}/{property}:{key}`), and that hash is the id
//! published in the owning component's `endpoints` map. Callers resolve it
//! through [`AppHandle::call_endpoint`](crate::AppHandle::call_endpoint).
//!
//! # Exactly once
//!
//! A slot accepts one value. The first call that passes validation claims
//! the slot, records the value under the endpoint path, removes the slot
//! and wakes the waiting handler. Any later call finds no slot and gets
//! `Endpoint not found`. On replay the recorded value resolves the endpoint
//! without registering a slot at all.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SynxioError};
use crate::identity::{endpoint_path, hash_path};
use crate::persistence::{AppLog, NewRecord, RecordKind};
use crate::registry::DurableMark;
use crate::store::StateStore;

type Validator = fn(&Value) -> std::result::Result<(), serde_json::Error>;

fn validate<T: DeserializeOwned>(value: &Value) -> std::result::Result<(), serde_json::Error> {
    T::deserialize(value).map(|_| ())
}

struct EndpointSlot {
    component_id: String,
    path: String,
    claimed: AtomicBool,
    sender: watch::Sender<Option<Value>>,
    validate: Validator,
}

/// Open endpoints of one application instance, by id.
#[derive(Clone, Default)]
pub(crate) struct EndpointTable {
    slots: Arc<DashMap<String, Arc<EndpointSlot>>>,
}

impl EndpointTable {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open<T: DeserializeOwned + 'static>(
        &self,
        log: &AppLog,
        store: &StateStore,
        durable: &Arc<DurableMark>,
        component_id: &str,
        component_path: &str,
        property: &str,
        key: &str,
    ) -> Result<Endpoint<T>> {
        let path = endpoint_path(component_path, property, key);
        let id = hash_path(&path);

        if let Some(row) = log.get(&path).await? {
            if row.kind == RecordKind::Data {
                debug!(endpoint_id = %id, %path, "endpoint resolved from log");
                return Ok(Endpoint {
                    id,
                    state: EndpointState::Resolved(row.payload.unwrap_or(Value::Null)),
                    durable: durable.clone(),
                    _marker: PhantomData,
                });
            }
        }

        let receiver = match self.slots.entry(id.clone()) {
            Entry::Occupied(slot) => slot.get().sender.subscribe(),
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(None);
                vacant.insert(Arc::new(EndpointSlot {
                    component_id: component_id.to_string(),
                    path: path.clone(),
                    claimed: AtomicBool::new(false),
                    sender,
                    validate: validate::<T>,
                }));
                debug!(endpoint_id = %id, %path, "endpoint opened");
                receiver
            }
        };
        store.open_endpoint(component_id, property, &id);

        Ok(Endpoint {
            id,
            state: EndpointState::Pending(receiver),
            durable: durable.clone(),
            _marker: PhantomData,
        })
    }

    /// Accept `value` for the endpoint `id`.
    pub(crate) fn resolve(&self, log: &AppLog, store: &StateStore, id: &str, value: Value) -> Result<()> {
        let slot = self
            .slots
            .get(id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| SynxioError::EndpointNotFound { id: id.to_string() })?;

        (slot.validate)(&value).map_err(SynxioError::EndpointDecode)?;

        if slot.claimed.swap(true, Ordering::AcqRel) {
            return Err(SynxioError::EndpointNotFound { id: id.to_string() });
        }

        self.slots.remove_if(id, |_, current| Arc::ptr_eq(current, &slot));
        store.close_endpoint(id);
        log.set(NewRecord::data(slot.path.clone(), value.clone()))?;
        slot.sender.send_replace(Some(value));

        debug!(endpoint_id = %id, component_id = %slot.component_id, "endpoint resolved");
        Ok(())
    }

    /// Drop one slot owned by `component_id`. Returns false if it was not
    /// open (already resolved, closed, or owned by another component).
    pub(crate) fn close(&self, component_id: &str, id: &str, store: &StateStore) -> bool {
        let removed = self
            .slots
            .remove_if(id, |_, slot| slot.component_id == component_id)
            .is_some();
        if removed {
            store.close_endpoint(id);
            debug!(endpoint_id = %id, %component_id, "endpoint closed");
        }
        removed
    }

    /// Drop every slot owned by `component_id`. Waiting handles see a
    /// cancellation.
    pub(crate) fn close_component(&self, component_id: &str, store: &StateStore) {
        let ids: Vec<String> = self
            .slots
            .iter()
            .filter(|slot| slot.component_id == component_id)
            .map(|slot| slot.key().clone())
            .collect();

        for id in ids {
            self.slots.remove(&id);
            store.close_endpoint(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }
}

enum EndpointState {
    Resolved(Value),
    Pending(watch::Receiver<Option<Value>>),
}

/// Handle on an opened endpoint.
pub struct Endpoint<T> {
    id: String,
    state: EndpointState,
    durable: Arc<DurableMark>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Endpoint<T> {
    /// Endpoint id, as published in the component's `endpoints` map.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True if the value is already known (replayed from the log).
    pub fn is_resolved(&self) -> bool {
        matches!(self.state, EndpointState::Resolved(_))
    }

    /// Wait for the value.
    ///
    /// Fails with [`SynxioError::Cancelled`] if the owning component ends
    /// before anyone calls the endpoint.
    pub async fn wait(self) -> Result<T> {
        let value = match self.state {
            EndpointState::Resolved(value) => value,
            EndpointState::Pending(mut receiver) => {
                let received = receiver
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| SynxioError::Cancelled)?
                    .clone();
                received.unwrap_or(Value::Null)
            }
        };
        self.durable.mark();
        serde_json::from_value(value).map_err(SynxioError::EndpointDecode)
    }
}

impl<T> std::fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("resolved", &matches!(self.state, EndpointState::Resolved(_)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MountInfo;
    use crate::persistence::{LogStore, LogWriter, MemoryLogStore, StreamReplayer};
    use crate::store::StateMap;
    use serde::Deserialize;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Message {
        kind: String,
        content: String,
    }

    struct Fixture {
        log: AppLog,
        store: StateStore,
        table: EndpointTable,
        durable: Arc<DurableMark>,
        component_id: String,
        records: MemoryLogStore,
    }

    impl Fixture {
        fn new(records: MemoryLogStore) -> Self {
            let backend: Arc<dyn LogStore> = Arc::new(records.clone());
            let (writer, _) = LogWriter::spawn("app", backend.clone(), CancellationToken::new());
            let log = AppLog::new("app", backend.clone(), writer, StreamReplayer::new("app", backend));
            let store = StateStore::new();
            let root = MountInfo::root("Post");
            store.register(&root, StateMap::new(), json!({}));
            Self {
                log,
                store,
                table: EndpointTable::default(),
                durable: Arc::new(DurableMark::default()),
                component_id: root.id(),
                records,
            }
        }

        async fn open(&self, key: &str) -> Endpoint<Message> {
            self.table
                .open(&self.log, &self.store, &self.durable, &self.component_id, "Post", "message", key)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_open_publishes_id() {
        let fx = Fixture::new(MemoryLogStore::new());
        let endpoint = fx.open("message-1").await;

        assert_eq!(endpoint.id(), hash_path("endpoint:Post/message:message-1"));
        let component = fx.store.component(&fx.component_id).unwrap();
        assert_eq!(component.endpoints.get("message").map(String::as_str), Some(endpoint.id()));
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let fx = Fixture::new(MemoryLogStore::new());
        let endpoint = fx.open("message-1").await;
        let id = endpoint.id().to_string();

        let value = json!({"kind": "message", "content": "shorter"});
        fx.table.resolve(&fx.log, &fx.store, &id, value.clone()).unwrap();
        let second = fx.table.resolve(&fx.log, &fx.store, &id, json!({"kind": "message", "content": "again"}));

        assert!(matches!(second, Err(SynxioError::EndpointNotFound { .. })));
        assert_eq!(
            endpoint.wait().await.unwrap(),
            Message { kind: "message".into(), content: "shorter".into() }
        );
        assert!(fx.store.component(&fx.component_id).unwrap().endpoints.is_empty());

        fx.log.flush().await.unwrap();
        let rows = fx.records.records("app");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "endpoint:Post/message:message-1");
        assert_eq!(rows[0].payload, Some(value));
    }

    #[tokio::test]
    async fn test_invalid_payload_keeps_endpoint_open() {
        let fx = Fixture::new(MemoryLogStore::new());
        let endpoint = fx.open("message-1").await;
        let id = endpoint.id().to_string();

        let result = fx.table.resolve(&fx.log, &fx.store, &id, json!({"kind": "message"}));

        assert!(matches!(result, Err(SynxioError::EndpointDecode(_))));
        assert!(fx.table.is_open(&id));
        fx.table
            .resolve(&fx.log, &fx.store, &id, json!({"kind": "message", "content": "ok"}))
            .unwrap();
    }

    #[tokio::test]
    async fn test_recorded_value_resolves_without_slot() {
        let records = MemoryLogStore::new();
        let first = Fixture::new(records.clone());
        let endpoint = first.open("approval-2").await;
        first
            .table
            .resolve(&first.log, &first.store, endpoint.id(), json!({"kind": "approval", "content": "ship it"}))
            .unwrap();
        first.log.flush().await.unwrap();

        let resumed = Fixture::new(records);
        let replayed = resumed.open("approval-2").await;

        assert!(replayed.is_resolved());
        assert!(!resumed.table.is_open(replayed.id()));
        assert_eq!(replayed.wait().await.unwrap().content, "ship it");
        assert!(resumed.durable.is_marked());
    }

    #[tokio::test]
    async fn test_closing_component_cancels_waiters() {
        let fx = Fixture::new(MemoryLogStore::new());
        let endpoint = fx.open("message-1").await;

        fx.table.close_component(&fx.component_id, &fx.store);

        assert!(matches!(endpoint.wait().await, Err(SynxioError::Cancelled)));
    }

    #[tokio::test]
    async fn test_closed_endpoint_rejects_calls() {
        let fx = Fixture::new(MemoryLogStore::new());
        let endpoint = fx.open("approval-1").await;
        let id = endpoint.id().to_string();

        assert!(!fx.table.close("someone-else", &id, &fx.store));
        assert!(fx.table.close(&fx.component_id, &id, &fx.store));

        let result = fx.table.resolve(&fx.log, &fx.store, &id, json!({"kind": "message", "content": "late"}));
        assert!(matches!(result, Err(SynxioError::EndpointNotFound { .. })));
        assert!(matches!(endpoint.wait().await, Err(SynxioError::Cancelled)));
        assert!(fx.store.component(&fx.component_id).unwrap().endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let fx = Fixture::new(MemoryLogStore::new());
        let result = fx.table.resolve(&fx.log, &fx.store, "nope", json!(null));
        assert_eq!(result.unwrap_err().to_string(), "Endpoint not found");
    }
}
