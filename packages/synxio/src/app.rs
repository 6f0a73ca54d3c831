//! Application instances: initialize, resume, and the handle callers use.
//!
//! ```text
//! App::builder(root) ──► App ──► initialize(app_id, payload) ──► AppHandle
//!                             └► resume(app_id) ───────────────┘
//!
//! AppHandle
//!   ├─ call_endpoint(id, value)   external input
//!   ├─ subscribe(session)         state, then patches
//!   ├─ snapshot()                 live tree
//!   ├─ join()                     root outcome
//!   └─ shutdown()                 cancel tree, wait, flush log
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::authz::{AllowAll, AuthCache, Authorizer};
use crate::broadcast;
use crate::component::{Component, ComponentHandle};
use crate::config::RuntimeConfig;
use crate::diff::{diff, Patch};
use crate::error::{Result, SynxioError};
use crate::identity::{MountInfo, INITIAL_PAYLOAD_ID};
use crate::persistence::{AppLog, LogStore, LogWriter, MemoryLogStore, NewRecord, StreamReplayer};
use crate::registry::{Registry, Scope};
use crate::store::{AppState, StateStore};

/// Message delivered to a state subscriber.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StateUpdate {
    /// Full authorized component map. Always the first message.
    State(Value),
    /// Changes since the previous message.
    Patch(Patch),
}

/// Outcome of an external endpoint call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CallEndpointResult {
    Success,
    Error { error: String },
}

impl CallEndpointResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CallEndpointResult::Success)
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct AppBuilder<C, A = AllowAll> {
    root: C,
    authorizer: A,
    store: Option<Arc<dyn LogStore>>,
    config: RuntimeConfig,
}

impl<C: Component + Clone, A: Authorizer> AppBuilder<C, A> {
    /// Replace the authorizer. Defaults to [`AllowAll`].
    pub fn authorizer<B: Authorizer>(self, authorizer: B) -> AppBuilder<C, B> {
        AppBuilder {
            root: self.root,
            authorizer,
            store: self.store,
            config: self.config,
        }
    }

    /// Log backend. Defaults to a fresh [`MemoryLogStore`].
    pub fn store(mut self, store: impl LogStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> App<C, A> {
        App {
            root: self.root,
            authorizer: Arc::new(self.authorizer),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryLogStore::new())),
            config: self.config,
        }
    }
}

// =============================================================================
// App
// =============================================================================

/// A root component bound to a log store. One `App` can run many
/// application instances, one per app id.
pub struct App<C, A = AllowAll> {
    root: C,
    authorizer: Arc<A>,
    store: Arc<dyn LogStore>,
    config: RuntimeConfig,
}

impl<C: Component + Clone> App<C, AllowAll> {
    pub fn builder(root: C) -> AppBuilder<C, AllowAll> {
        AppBuilder {
            root,
            authorizer: AllowAll,
            store: None,
            config: RuntimeConfig::default(),
        }
    }
}

impl<C: Component + Clone, A: Authorizer> App<C, A> {
    /// Persist `payload` as the initial payload of `app_id` and mount the root.
    pub async fn initialize(&self, app_id: &str, payload: C::Payload) -> Result<AppHandle<C::Output, A>> {
        if self.store.get(app_id, INITIAL_PAYLOAD_ID).await?.is_some() {
            return Err(SynxioError::AlreadyInitialized {
                app_id: app_id.to_string(),
            });
        }
        let record = NewRecord::data(INITIAL_PAYLOAD_ID, serde_json::to_value(&payload)?);
        self.start(app_id, payload, Some(record)).await
    }

    /// Re-mount the root of an existing instance from its persisted payload.
    pub async fn resume(&self, app_id: &str) -> Result<AppHandle<C::Output, A>> {
        let Some(row) = self.store.get(app_id, INITIAL_PAYLOAD_ID).await? else {
            return Err(SynxioError::NotInitialized {
                app_id: app_id.to_string(),
            });
        };
        let payload = serde_json::from_value(row.payload.unwrap_or(Value::Null))?;
        self.start(app_id, payload, None).await
    }

    async fn start(
        &self,
        app_id: &str,
        payload: C::Payload,
        initial: Option<NewRecord>,
    ) -> Result<AppHandle<C::Output, A>> {
        let shutdown = CancellationToken::new();
        let (writer, _) = LogWriter::spawn(app_id, self.store.clone(), shutdown.clone());
        let replayer = StreamReplayer::with_buffer(app_id, self.store.clone(), self.config.replay_buffer);
        let log = AppLog::new(app_id, self.store.clone(), writer, replayer);

        let resumed = initial.is_none();
        if let Some(record) = initial {
            log.set(record)?;
            log.flush().await?;
        }

        let store = StateStore::new();
        let background = TaskTracker::new();
        let changes = broadcast::spawn(&store, self.config.debounce, shutdown.clone(), &background);

        let registry = Registry::new(log, store, shutdown.clone());
        let scope = Scope::root(shutdown.clone());
        let root = registry
            .mount(&scope, MountInfo::root(C::NAME), self.root.clone(), payload)
            .await?;

        info!(app_id, root = C::NAME, resumed, "application started");

        Ok(AppHandle {
            app_id: app_id.to_string(),
            root_id: root.id().to_string(),
            registry,
            authorizer: self.authorizer.clone(),
            changes,
            debounce: self.config.debounce,
            shutdown,
            scope,
            background,
            root: Some(root),
        })
    }
}

impl<C, A> std::fmt::Debug for App<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Handle
// =============================================================================

/// A running application instance.
pub struct AppHandle<O, A: Authorizer = AllowAll> {
    app_id: String,
    root_id: String,
    registry: Arc<Registry>,
    authorizer: Arc<A>,
    changes: watch::Receiver<Arc<AppState>>,
    debounce: Duration,
    shutdown: CancellationToken,
    scope: Scope,
    background: TaskTracker,
    root: Option<ComponentHandle<O>>,
}

impl<O, A: Authorizer> AppHandle<O, A> {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Id of the root component.
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Live component tree, unfiltered.
    pub fn snapshot(&self) -> AppState {
        self.registry.store.snapshot()
    }

    /// True once the instance has been shut down or torn down by a
    /// storage fault.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolve the endpoint `id` with `value`.
    pub fn call_endpoint(&self, id: &str, value: Value) -> CallEndpointResult {
        let registry = &self.registry;
        match registry.endpoints.resolve(&registry.log, &registry.store, id, value) {
            Ok(()) => CallEndpointResult::Success,
            Err(e) => {
                debug!(app_id = %self.app_id, endpoint_id = %id, error = %e, "endpoint call rejected");
                CallEndpointResult::Error { error: e.to_string() }
            }
        }
    }

    /// Stream of updates for one session: the current authorized tree,
    /// then a patch per debounced change that is visible to the session.
    ///
    /// Every message is rendered from the debounced feed, so a patch is
    /// never older than the message before it. If the feed is behind the
    /// live tree when the stream is first polled, the first message waits
    /// for the next broadcast.
    ///
    /// The stream ends when the instance shuts down.
    pub fn subscribe(&self, session: A::Session) -> BoxStream<'static, Result<StateUpdate>> {
        let store = self.registry.store.clone();
        let authorizer = self.authorizer.clone();
        let mut changes = self.changes.clone();
        let settle = (self.debounce * 2).max(Duration::from_millis(50));

        Box::pin(async_stream::stream! {
            let behind = {
                let live = store.snapshot();
                **changes.borrow_and_update() != live
            };
            if behind {
                // A change reverted inside the debounce window is never
                // broadcast, so the wait is bounded. Shutdown closes the feed
                // but the last broadcast stays readable.
                let _ = tokio::time::timeout(settle, changes.changed()).await;
            }
            let first = changes.borrow_and_update().clone();

            let mut cache = AuthCache::new(authorizer, session);
            let mut current = match cache.render(&first).await {
                Ok(view) => view,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            yield Ok(StateUpdate::State(current.clone()));

            while changes.changed().await.is_ok() {
                let latest = changes.borrow_and_update().clone();
                let next = match cache.render(&latest).await {
                    Ok(view) => view,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let patch = diff(&current, &next);
                if patch.is_empty() {
                    continue;
                }
                current = next;
                yield Ok(StateUpdate::Patch(patch));
            }
        })
    }

    /// Wait for the root component's outcome. Only the first completed call
    /// gets it; later calls fail with [`SynxioError::Cancelled`].
    ///
    /// Cancel safe, so it can sit in a `select!` loop.
    pub async fn join(&mut self) -> Result<O> {
        let Some(root) = self.root.as_mut() else {
            return Err(SynxioError::Cancelled);
        };
        let outcome = root.wait().await;
        self.root = None;
        outcome
    }

    /// Cancel the tree, wait for every task, and flush the log.
    pub async fn shutdown(self) -> Result<()> {
        info!(app_id = %self.app_id, running = self.registry.running(), "application stopping");

        self.shutdown.cancel();
        self.scope.tracker.close();
        self.scope.tracker.wait().await;
        self.background.close();
        self.background.wait().await;
        let flushed = self.registry.log.flush().await;

        info!(app_id = %self.app_id, "application stopped");
        flushed
    }
}

impl<O, A: Authorizer> std::fmt::Debug for AppHandle<O, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppHandle")
            .field("app_id", &self.app_id)
            .field("registry", &self.registry)
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ComponentContext;
    use crate::diff::apply_patch;
    use crate::state::{InitialState, StateSlot};
    use crate::store::{ComponentStatus, StateMap};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;

    const GREETING: StateSlot<Option<String>> = StateSlot::new("greeting", || None);

    #[derive(Clone)]
    struct Greeter;

    #[async_trait]
    impl Component for Greeter {
        const NAME: &'static str = "Greeter";
        type Payload = String;
        type Output = String;

        fn initial_state() -> StateMap {
            InitialState::new().slot(&GREETING).build()
        }

        async fn run(&self, ctx: ComponentContext, salutation: String) -> anyhow::Result<String> {
            let name = ctx.endpoint::<String>("name", "name-0").await?.wait().await?;
            let greeting = format!("{}, {}", salutation, name);
            ctx.set(&GREETING, Some(greeting.clone()))?;
            Ok(greeting)
        }
    }

    async fn endpoint_id<O, A: Authorizer>(handle: &AppHandle<O, A>) -> String {
        let root_id = handle.root_id().to_string();
        for _ in 0..100 {
            if let Some(id) = handle
                .snapshot()
                .component(&root_id)
                .and_then(|root| root.endpoints.get("name").cloned())
            {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("endpoint never opened");
    }

    #[tokio::test]
    async fn test_initialize_call_and_join() {
        let app = App::builder(Greeter).build();
        let mut handle = app.initialize("app-1", "Hello".to_string()).await.unwrap();

        let id = endpoint_id(&handle).await;
        assert!(handle.call_endpoint(&id, json!("Ada")).is_success());
        assert_eq!(handle.join().await.unwrap(), "Hello, Ada");

        let root = handle.snapshot().component(handle.root_id()).cloned().unwrap();
        assert_eq!(root.status, ComponentStatus::Completed);
        assert_eq!(root.state["greeting"], json!("Hello, Ada"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_endpoint_errors() {
        let app = App::builder(Greeter).build();
        let handle = app.initialize("app-1", "Hello".to_string()).await.unwrap();
        let id = endpoint_id(&handle).await;

        assert_eq!(
            handle.call_endpoint("missing", json!("Ada")),
            CallEndpointResult::Error { error: "Endpoint not found".into() }
        );
        assert!(!handle.call_endpoint(&id, json!(42)).is_success());
        assert!(handle.call_endpoint(&id, json!("Ada")).is_success());
        assert_eq!(
            serde_json::to_value(handle.call_endpoint(&id, json!("Bob"))).unwrap(),
            json!({"type": "error", "error": "Endpoint not found"})
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_replays_endpoint_value() {
        let records = MemoryLogStore::new();
        let app = App::builder(Greeter).store(records.clone()).build();

        let mut first = app.initialize("app-1", "Hi".to_string()).await.unwrap();
        let id = endpoint_id(&first).await;
        first.call_endpoint(&id, json!("Grace"));
        first.join().await.unwrap();
        first.shutdown().await.unwrap();

        let mut resumed = app.resume("app-1").await.unwrap();
        assert_eq!(resumed.join().await.unwrap(), "Hi, Grace");
        assert!(resumed.snapshot().open_endpoints.is_empty());
        resumed.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_and_resume_guards() {
        let app = App::builder(Greeter).build();

        assert!(matches!(
            app.resume("nope").await,
            Err(SynxioError::NotInitialized { .. })
        ));

        let handle = app.initialize("app-1", "Hello".to_string()).await.unwrap();
        assert!(matches!(
            app.initialize("app-1", "Hello".to_string()).await,
            Err(SynxioError::AlreadyInitialized { .. })
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_sends_state_then_patches() {
        let app = App::builder(Greeter).build();
        let mut handle = app.initialize("app-1", "Hello".to_string()).await.unwrap();
        let id = endpoint_id(&handle).await;
        let root_id = handle.root_id().to_string();

        let mut updates = handle.subscribe(());
        let Some(Ok(StateUpdate::State(mut view))) = updates.next().await else {
            panic!("expected a full state first");
        };
        assert_eq!(view[&root_id]["endpoints"]["name"], json!(id));

        handle.call_endpoint(&id, json!("Ada"));
        handle.join().await.unwrap();

        while view[&root_id]["status"] != "completed" {
            match updates.next().await {
                Some(Ok(StateUpdate::Patch(patch))) => apply_patch(&mut view, &patch).unwrap(),
                other => panic!("expected a patch, got {:?}", other),
            }
        }
        assert_eq!(view[&root_id]["state"]["greeting"], "Hello, Ada");
        assert!(view[&root_id]["endpoints"].as_object().unwrap().is_empty());

        handle.shutdown().await.unwrap();
        assert!(updates.next().await.is_none());
    }

    const COUNT: StateSlot<u32> = StateSlot::new("count", || 0);

    /// Waits on `tick-1` and `tick-2` in turn, publishing the tick count.
    #[derive(Clone)]
    struct Ticker;

    #[async_trait]
    impl Component for Ticker {
        const NAME: &'static str = "Ticker";
        type Payload = ();
        type Output = u32;

        fn initial_state() -> StateMap {
            InitialState::new().slot(&COUNT).build()
        }

        async fn run(&self, ctx: ComponentContext, _: ()) -> anyhow::Result<u32> {
            for tick in 1..=2u32 {
                ctx.endpoint::<()>("tick", &format!("tick-{}", tick)).await?.wait().await?;
                ctx.set(&COUNT, tick)?;
            }
            Ok(2)
        }
    }

    async fn tick_endpoint<O, A: Authorizer>(handle: &AppHandle<O, A>, previous: Option<&str>) -> String {
        let root_id = handle.root_id().to_string();
        for _ in 0..100 {
            let open = handle
                .snapshot()
                .component(&root_id)
                .and_then(|root| root.endpoints.get("tick").cloned());
            if let Some(id) = open.filter(|id| Some(id.as_str()) != previous) {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("tick endpoint never opened");
    }

    fn count(view: &Value, root_id: &str) -> u64 {
        view[root_id]["state"]["count"].as_u64().unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_never_sees_older_state() {
        let app = App::builder(Ticker).build();
        let handle = app.initialize("app-1", ()).await.unwrap();
        let root_id = handle.root_id().to_string();

        // Created now, first polled only after two changes.
        let mut updates = handle.subscribe(());

        let first_tick = tick_endpoint(&handle, None).await;
        assert!(handle.call_endpoint(&first_tick, json!(null)).is_success());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second_tick = tick_endpoint(&handle, Some(&first_tick)).await;
        assert!(handle.call_endpoint(&second_tick, json!(null)).is_success());
        while handle.snapshot().component(&root_id).map(|root| root.status) != Some(ComponentStatus::Completed) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let Some(Ok(StateUpdate::State(mut view))) = updates.next().await else {
            panic!("expected a full state first");
        };
        let mut seen = count(&view, &root_id);
        assert_eq!(seen, 2);

        while let Ok(Some(update)) = tokio::time::timeout(Duration::from_millis(200), updates.next()).await {
            match update {
                Ok(StateUpdate::Patch(patch)) => apply_patch(&mut view, &patch).unwrap(),
                other => panic!("expected a patch, got {:?}", other),
            }
            let next = count(&view, &root_id);
            assert!(next >= seen, "count went from {} back to {}", seen, next);
            assert_ne!(view[&root_id]["endpoints"]["tick"], json!(first_tick));
            seen = next;
        }
        assert_eq!(view[&root_id]["status"], "completed");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_state_includes_changes_before_first_poll() {
        let app = App::builder(Ticker).build();
        let handle = app.initialize("app-1", ()).await.unwrap();
        let root_id = handle.root_id().to_string();
        let first_tick = tick_endpoint(&handle, None).await;

        let mut updates = handle.subscribe(());
        let Some(Ok(StateUpdate::State(view))) = updates.next().await else {
            panic!("expected a full state first");
        };

        assert_eq!(view[&root_id]["endpoints"]["tick"], json!(first_tick));
        assert_eq!(count(&view, &root_id), 0);
        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_state_update_wire_shape() {
        let state = serde_json::to_value(StateUpdate::State(json!({}))).unwrap();
        assert_eq!(state, json!({"type": "state", "value": {}}));

        let patch = serde_json::to_value(StateUpdate::Patch(Vec::new())).unwrap();
        assert_eq!(patch, json!({"type": "patch", "value": []}));
    }
}
