//! The API a component handler works against.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::component::{Component, ComponentHandle};
use crate::endpoint::Endpoint;
use crate::error::{Result, SynxioError};
use crate::identity::{io_id, ListKey, MountInfo};
use crate::io::{self, EventEmitter, EventStream};
use crate::registry::{Registry, Scope};
use crate::state::StateSlot;

/// Handle given to [`Component::run`].
///
/// Cheap to clone. Everything it does is scoped to the component it was
/// created for: state reads and writes, durable IO keyed under the
/// component's path, endpoints, and child mounts inside its lifetime.
#[derive(Clone)]
pub struct ComponentContext {
    registry: Arc<Registry>,
    mount: Arc<MountInfo>,
    id: Arc<str>,
    path: Arc<str>,
    scope: Scope,
}

impl ComponentContext {
    pub(crate) fn new(registry: Arc<Registry>, mount: MountInfo, scope: Scope) -> Self {
        Self {
            id: mount.id().into(),
            path: mount.path().into(),
            mount: Arc::new(mount),
            registry,
            scope,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.mount.name()
    }

    pub fn app_id(&self) -> &str {
        self.registry.app_id()
    }

    /// True once the component has been cancelled or replaced.
    pub fn is_cancelled(&self) -> bool {
        self.scope.token.is_cancelled()
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn get<T: Serialize + DeserializeOwned>(&self, slot: &StateSlot<T>) -> Result<T> {
        self.registry
            .store
            .read(|state| state.components.get(&*self.id).map(|c| slot.read(&c.state)))
            .unwrap_or_else(|| {
                Err(SynxioError::ComponentNotFound {
                    id: self.id.to_string(),
                })
            })
    }

    pub fn set<T: Serialize + DeserializeOwned>(&self, slot: &StateSlot<T>, value: T) -> Result<()> {
        self.registry
            .store
            .update_state(&self.id, |state| slot.write(state, &value))
    }

    /// Apply `f` to the current (or default) value and store the result.
    pub fn update<T, F>(&self, slot: &StateSlot<T>, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.registry.store.update_state(&self.id, |state| {
            let next = f(slot.read(state)?);
            slot.write(state, &next)?;
            Ok(next)
        })
    }

    // =========================================================================
    // Durable IO
    // =========================================================================

    /// Run `op` once per application instance.
    ///
    /// The outcome is recorded under `io:{path}/{key}`. Later runs, including
    /// a resumed one, get the recorded value (or error) back without calling
    /// `op`.
    pub async fn io<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let id = io_id(&self.path, key);
        io::run(&self.registry.log, &self.scope.durable, &id, op).await
    }

    /// Like [`io`](Self::io), but `op` can emit events while it runs.
    ///
    /// Emitted events are recorded as stream chunks. A resumed run replays
    /// the recorded events in order instead of calling `op`.
    pub async fn io_with_events<E, T, F, Fut>(&self, key: &str, op: F) -> Result<EventStream<E, T>>
    where
        E: Serialize + DeserializeOwned + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(EventEmitter<E>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let id = io_id(&self.path, key);
        io::run_with_events(&self.registry.log, &self.scope, &id, op).await
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Open (or re-attach to) the endpoint `key` under `property`.
    ///
    /// The endpoint id is published in this component's `endpoints` map
    /// until a value is accepted or the component ends.
    pub async fn endpoint<T: DeserializeOwned + 'static>(
        &self,
        property: &str,
        key: &str,
    ) -> Result<Endpoint<T>> {
        self.registry
            .endpoints
            .open(
                &self.registry.log,
                &self.registry.store,
                &self.scope.durable,
                &self.id,
                &self.path,
                property,
                key,
            )
            .await
    }

    /// Stop accepting values for an endpoint this component opened, e.g. the
    /// loser of a race. Handles still waiting on it see a cancellation.
    ///
    /// Returns false if the endpoint was not open.
    pub fn close_endpoint(&self, id: &str) -> bool {
        self.registry
            .endpoints
            .close(&self.id, id, &self.registry.store)
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Mount a singleton child under `property`.
    pub async fn mount<C: Component>(
        &self,
        property: &str,
        component: C,
        payload: C::Payload,
    ) -> Result<ComponentHandle<C::Output>> {
        let mount = MountInfo::Singleton {
            parent_id: self.id.to_string(),
            parent_path: self.path.to_string(),
            property: property.to_string(),
            name: C::NAME.to_string(),
        };
        self.registry.mount(&self.scope, mount, component, payload).await
    }

    /// Mount a list child under `property` at `key`.
    ///
    /// Mounting the same key again replaces the running instance.
    pub async fn mount_list<C: Component>(
        &self,
        property: &str,
        key: impl Into<ListKey>,
        component: C,
        payload: C::Payload,
    ) -> Result<ComponentHandle<C::Output>> {
        let mount = MountInfo::List {
            parent_id: self.id.to_string(),
            parent_path: self.path.to_string(),
            property: property.to_string(),
            name: C::NAME.to_string(),
            key: key.into(),
        };
        self.registry.mount(&self.scope, mount, component, payload).await
    }
}

impl std::fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentContext")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}
