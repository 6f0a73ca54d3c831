//! Component trait and mount handles.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::context::ComponentContext;
use crate::error::{Result, SynxioError};
use crate::store::StateMap;

/// A unit of stateful, possibly long-running work.
///
/// The handler must be deterministic with respect to the log: anything that
/// talks to the outside world goes through [`ComponentContext::io`] or an
/// endpoint, so a resumed run makes the same decisions as the first one.
///
/// # Example
///
/// ```ignore
/// struct Greeter;
///
/// const GREETING: StateSlot<Option<String>> = StateSlot::new("greeting", || None);
///
/// #[async_trait]
/// impl Component for Greeter {
///     const NAME: &'static str = "Greeter";
///     type Payload = String;
///     type Output = String;
///
///     fn initial_state() -> StateMap {
///         InitialState::new().slot(&GREETING).build()
///     }
///
///     async fn run(&self, ctx: ComponentContext, name: String) -> anyhow::Result<String> {
///         let name = ctx.endpoint::<String>("name", "name").await?.wait().await?;
///         let greeting = format!("hello {}", name);
///         ctx.set(&GREETING, Some(greeting.clone()))?;
///         Ok(greeting)
///     }
/// }
/// ```
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Name used in mount paths and shown to the authorizer.
    const NAME: &'static str;

    /// Mount payload. Persisted for the root, shown to the authorizer for all.
    type Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    type Output: Send + 'static;

    /// State the component is registered with.
    fn initial_state() -> StateMap {
        StateMap::new()
    }

    async fn run(&self, ctx: ComponentContext, payload: Self::Payload) -> anyhow::Result<Self::Output>;
}

/// Handle on a mounted component's outcome.
#[derive(Debug)]
pub struct ComponentHandle<O> {
    id: String,
    name: &'static str,
    outcome: oneshot::Receiver<Result<O>>,
}

impl<O> ComponentHandle<O> {
    pub(crate) fn new(id: String, name: &'static str, outcome: oneshot::Receiver<Result<O>>) -> Self {
        Self { id, name, outcome }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for the component to finish.
    ///
    /// A failed component yields [`SynxioError::ComponentFailed`]; one that
    /// was cancelled or replaced yields [`SynxioError::Cancelled`].
    pub async fn join(mut self) -> Result<O> {
        self.wait().await
    }

    /// Like [`join`](Self::join), but cancel safe: dropping the future
    /// before it completes leaves the handle usable.
    pub(crate) async fn wait(&mut self) -> Result<O> {
        match (&mut self.outcome).await {
            Ok(result) => result,
            Err(_) => Err(SynxioError::Cancelled),
        }
    }
}
