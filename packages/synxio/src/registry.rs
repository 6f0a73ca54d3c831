//! Component registry: mounting, structured task scopes, and finalization.
//!
//! # Lifecycle
//!
//! ```text
//! mount ──► cancel + await previous task under the same id
//!       ──► register (status = running, linked into parent)
//!       ──► spawn handler on the parent's tracker, child token
//!
//! handler ends ──► cancel own token
//!              ──► close + wait own tracker (children finish first)
//!              ──► drop open endpoints
//!              ──► Ok        → completed
//!                  Err       → failed
//!                  cancelled → deregistered, or failed if durable history exists
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::component::{Component, ComponentHandle};
use crate::context::ComponentContext;
use crate::endpoint::EndpointTable;
use crate::error::{is_fatal_chain, Result, SynxioError};
use crate::identity::MountInfo;
use crate::persistence::AppLog;
use crate::store::{ComponentStatus, StateStore};

/// Records whether a component (or anything below it) has touched the log.
#[derive(Debug, Default)]
pub(crate) struct DurableMark {
    observed: AtomicBool,
    parent: Option<Arc<DurableMark>>,
}

impl DurableMark {
    fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            observed: AtomicBool::new(false),
            parent: Some(self.clone()),
        })
    }

    pub(crate) fn mark(&self) {
        if self.observed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(parent) = &self.parent {
            parent.mark();
        }
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.observed.load(Ordering::Acquire)
    }
}

/// Lifetime scope a component's children and background work run in.
#[derive(Clone, Debug)]
pub(crate) struct Scope {
    pub(crate) token: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) durable: Arc<DurableMark>,
}

impl Scope {
    pub(crate) fn root(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
            durable: Arc::new(DurableMark::default()),
        }
    }

    fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
            durable: self.durable.child(),
        }
    }
}

struct RunningTask {
    epoch: u64,
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Per-application registry of mounted components.
pub(crate) struct Registry {
    app_id: Arc<str>,
    pub(crate) log: AppLog,
    pub(crate) store: StateStore,
    pub(crate) endpoints: EndpointTable,
    tasks: DashMap<String, RunningTask>,
    epochs: AtomicU64,
    shutdown: CancellationToken,
}

impl Registry {
    pub(crate) fn new(log: AppLog, store: StateStore, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            app_id: log.app_id().into(),
            log,
            store,
            endpoints: EndpointTable::default(),
            tasks: DashMap::new(),
            epochs: AtomicU64::new(0),
            shutdown,
        })
    }

    pub(crate) fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Number of component tasks currently running.
    pub(crate) fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Mount `component` at `mount` inside `parent`.
    ///
    /// A task already running under the same id is cancelled and awaited
    /// before the new instance registers.
    pub(crate) async fn mount<C: Component>(
        self: &Arc<Self>,
        parent: &Scope,
        mount: MountInfo,
        component: C,
        payload: C::Payload,
    ) -> Result<ComponentHandle<C::Output>> {
        let id = mount.id();
        let payload_value = serde_json::to_value(&payload)?;

        self.cancel_previous(&id).await;

        let generation = self.store.register(&mount, C::initial_state(), payload_value);
        let scope = parent.child();
        let epoch = self.epochs.fetch_add(1, Ordering::AcqRel);
        let finished = CancellationToken::new();
        self.tasks.insert(
            id.clone(),
            RunningTask {
                epoch,
                cancel: scope.token.clone(),
                finished: finished.clone(),
            },
        );

        debug!(
            app_id = %self.app_id,
            component_id = %id,
            name = C::NAME,
            path = %mount.path(),
            generation,
            "component mounted"
        );

        let ctx = ComponentContext::new(self.clone(), mount, scope.clone());
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let registry = self.clone();
        let task_id = id.clone();

        parent.tracker.spawn(async move {
            let token = scope.token.clone();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = AssertUnwindSafe(component.run(ctx, payload)).catch_unwind() => {
                    Some(match result {
                        Ok(inner) => inner,
                        Err(panic_info) => {
                            let panic_msg = extract_panic_message(&panic_info);
                            error!(component_id = %task_id, panic = %panic_msg, "component panicked");
                            Err(anyhow::anyhow!("component panicked: {}", panic_msg))
                        }
                    })
                }
            };

            registry
                .finalize(&task_id, C::NAME, scope, outcome, outcome_tx)
                .await;
            registry.tasks.remove_if(&task_id, |_, task| task.epoch == epoch);
            finished.cancel();
        });

        // Let the child start before the parent races anything against it.
        tokio::task::yield_now().await;

        Ok(ComponentHandle::new(id, C::NAME, outcome_rx))
    }

    async fn cancel_previous(&self, id: &str) {
        let Some((_, previous)) = self.tasks.remove(id) else {
            return;
        };
        debug!(app_id = %self.app_id, component_id = %id, "replacing running component");
        previous.cancel.cancel();
        previous.finished.cancelled().await;
    }

    async fn finalize<O>(
        &self,
        id: &str,
        name: &'static str,
        scope: Scope,
        outcome: Option<anyhow::Result<O>>,
        outcome_tx: oneshot::Sender<Result<O>>,
    ) {
        scope.token.cancel();
        scope.tracker.close();
        scope.tracker.wait().await;

        self.endpoints.close_component(id, &self.store);

        match outcome {
            Some(Ok(output)) => {
                self.store.set_status(id, ComponentStatus::Completed);
                debug!(app_id = %self.app_id, component_id = %id, name, "component completed");
                let _ = outcome_tx.send(Ok(output));
            }
            Some(Err(e)) => {
                let message = format!("{:#}", e);
                if is_fatal_chain(&e) {
                    error!(
                        app_id = %self.app_id,
                        component_id = %id,
                        name,
                        error = %message,
                        "storage fault in component, tearing down application"
                    );
                    self.shutdown.cancel();
                } else {
                    warn!(app_id = %self.app_id, component_id = %id, name, error = %message, "component failed");
                }
                self.store.set_status(id, ComponentStatus::Failed);
                let _ = outcome_tx.send(Err(SynxioError::ComponentFailed {
                    name: name.to_string(),
                    id: id.to_string(),
                    message,
                }));
            }
            None if scope.durable.is_marked() => {
                self.store.set_status(id, ComponentStatus::Failed);
                debug!(app_id = %self.app_id, component_id = %id, name, "component cancelled after durable history");
            }
            None => {
                self.store.deregister(id);
                debug!(app_id = %self.app_id, component_id = %id, name, "component cancelled, deregistered");
            }
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("app_id", &self.app_id)
            .field("running", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
