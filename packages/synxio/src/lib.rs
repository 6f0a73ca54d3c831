//! # Synxio
//!
//! A durable runtime for trees of long-running components that wait on
//! external input, stream progress, and survive restarts by replaying an
//! append-only log.
//!
//! ## Core Concepts
//!
//! - A [`Component`] is a typed unit of work. Its handler runs as a task,
//!   mounts children, opens [`Endpoint`]s and calls durable IO.
//! - State is published, not stored. Each component owns a map of
//!   [`StateSlot`]s that subscribers see, and that is rebuilt on resume by
//!   running the handlers again.
//! - Effects are stored, not repeated. Everything that touches the outside
//!   world goes through [`ComponentContext::io`] (or `io_with_events`) and
//!   an endpoint, and its outcome is appended to the log under a
//!   path-derived id.
//!
//! ## Architecture
//!
//! ```text
//!  callers                                   subscribers
//!     │ call_endpoint(id, value)                  ▲ state / patch
//!     ▼                                           │
//! ┌──────────────┐  resolve   ┌───────────┐   ┌────────────────┐
//! │  AppHandle   │──────────► │ Endpoints │   │ AuthCache      │ per session
//! └──────┬───────┘            └─────┬─────┘   │ render + diff  │
//!        │ mount root               │ wake    └────────▲───────┘
//!        ▼                          ▼                  │ debounced
//! ┌────────────────────────────────────────┐   ┌───────┴────────┐
//! │ Registry: one task per component,      │──►│ StateStore     │
//! │ child tokens, task trackers            │   │ (watch<Tree>)  │
//! └──────┬──────────────────────┬──────────┘   └────────────────┘
//!        │ io / io_with_events  │ endpoint values
//!        ▼                      ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ LogWriter (single consumer) ──► LogStore (memory/sqlite) │
//! │ StreamReplayer ◄── next_after walk                       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Deterministic identity**: a component's id is the hash of its mount
//!   path, so the same mount in a resumed run lands on the same id.
//! - **Exactly-once effects**: a recorded durable operation is never
//!   invoked again for the same application instance.
//! - **Exactly-once endpoints**: the first valid call wins, later calls get
//!   `Endpoint not found`.
//! - **Structured cancellation**: children finish before their parent's
//!   outcome is recorded.
//! - **Fatal storage faults**: a failed append tears the instance down.
//!
//! ## Example
//!
//! ```ignore
//! use synxio::{App, Component, ComponentContext, InitialState, StateMap, StateSlot};
//!
//! const ANSWER: StateSlot<Option<String>> = StateSlot::new("answer", || None);
//!
//! #[derive(Clone)]
//! struct Ask;
//!
//! #[async_trait::async_trait]
//! impl Component for Ask {
//!     const NAME: &'static str = "Ask";
//!     type Payload = String;
//!     type Output = String;
//!
//!     fn initial_state() -> StateMap {
//!         InitialState::new().slot(&ANSWER).build()
//!     }
//!
//!     async fn run(&self, ctx: ComponentContext, question: String) -> anyhow::Result<String> {
//!         let answer = ctx.endpoint::<String>("answer", "answer-0").await?.wait().await?;
//!         ctx.set(&ANSWER, Some(answer.clone()))?;
//!         Ok(answer)
//!     }
//! }
//!
//! let app = App::builder(Ask).build();
//! let mut handle = app.initialize("app-1", "Ship it?".into()).await?;
//! let mut updates = handle.subscribe(());
//! // ... an external caller resolves the endpoint id published in state ...
//! let answer = handle.join().await?;
//! handle.shutdown().await?;
//! ```

mod app;
mod authz;
mod broadcast;
mod component;
mod config;
mod context;
mod endpoint;
mod error;
mod identity;
mod io;
mod registry;
mod state;
mod store;

pub mod diff;
pub mod persistence;

// Application entry points
pub use app::{App, AppBuilder, AppHandle, CallEndpointResult, StateUpdate};

// Component authoring
pub use component::{Component, ComponentHandle};
pub use context::ComponentContext;
pub use endpoint::Endpoint;
pub use io::{EventEmitter, EventStream};
pub use state::{InitialState, StateSlot};

// Authorization
pub use authz::{AllowAll, Authorizer, ComponentInfo};

// Configuration
pub use config::{RuntimeConfig, DEFAULT_DEBOUNCE};

// Errors
pub use error::{Result, SynxioError};

// Identity helpers
pub use identity::{
    chunk_id, endpoint_path, escape_segment, hash_path, io_id, stream_id, stream_start_id, ListKey,
    MountInfo, INITIAL_PAYLOAD_ID,
};

// Published tree
pub use store::{
    AppState, ChildRef, ComponentMeta, ComponentState, ComponentStatus, OpenEndpoint, StateMap,
};

// Persistence
pub use persistence::{LogRecord, LogStore, MemoryLogStore, RecordKind, StoreError};
#[cfg(feature = "sqlite")]
pub use persistence::SqliteLogStore;

// Re-export commonly used external types
pub use async_trait::async_trait;
