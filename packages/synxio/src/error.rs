//! Structured error types for the synxio runtime.
//!
//! `SynxioError` is what crosses the runtime boundary. Component handlers
//! work in `anyhow::Result` and the registry converts on the way out, the
//! same way durable IO converts a failed operation into an `error` record.
//!
//! # Taxonomy
//!
//! - Storage faults ([`SynxioError::Store`], [`SynxioError::WriterClosed`])
//!   are fatal to the application instance. See [`SynxioError::is_fatal`].
//! - Endpoint decode faults are local to one caller and leave the endpoint open.
//! - Handler faults fail the owning component only.
//! - Durable IO faults are persisted and replayed as [`SynxioError::Io`].

use thiserror::Error;

use crate::persistence::StoreError;

/// Result alias used across the crate.
pub type Result<T, E = SynxioError> = std::result::Result<T, E>;

/// Errors surfaced by the runtime.
#[derive(Debug, Error)]
pub enum SynxioError {
    /// The persistence backend failed. The instance is torn down.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The background writer has stopped (after a storage fault or shutdown).
    #[error("persistence writer is closed")]
    WriterClosed,

    /// `resume` was called for an app id with no persisted initial payload.
    #[error("application {app_id} has not been initialized")]
    NotInitialized {
        /// The requested application instance.
        app_id: String,
    },

    /// `initialize` was called for an app id that already has a log.
    #[error("application {app_id} is already initialized")]
    AlreadyInitialized {
        /// The requested application instance.
        app_id: String,
    },

    /// A durable operation failed, now or in a previous run.
    #[error("durable operation {id} failed: {message}")]
    Io {
        /// Log id of the operation (`io:{path}/{key}`).
        id: String,
        /// Rendered error chain as persisted.
        message: String,
    },

    /// A state slot held a value that does not decode into the slot type.
    #[error("state slot {slot} holds an incompatible value: {source}")]
    State {
        /// Slot name.
        slot: String,
        #[source]
        source: serde_json::Error,
    },

    /// The component is not (or no longer) part of the tree.
    #[error("component not mounted: {id}")]
    ComponentNotFound {
        /// Component id.
        id: String,
    },

    /// No open endpoint with this id.
    #[error("Endpoint not found")]
    EndpointNotFound {
        /// Endpoint id as supplied by the caller.
        id: String,
    },

    /// The payload did not match the endpoint schema.
    #[error("invalid endpoint payload: {0}")]
    EndpointDecode(#[source] serde_json::Error),

    /// A child component ended in the `failed` state.
    #[error("component {name} ({id}) failed: {message}")]
    ComponentFailed {
        /// Component name.
        name: String,
        /// Component id.
        id: String,
        /// Rendered error chain of the handler.
        message: String,
    },

    /// The awaited work was cancelled before it produced a value.
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization of a payload or persisted value failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SynxioError {
    /// Storage faults terminate the application instance.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SynxioError::Store(_) | SynxioError::WriterClosed)
    }
}

/// Returns true if any error in the chain is a fatal runtime error.
pub(crate) fn is_fatal_chain(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<SynxioError>())
        .any(SynxioError::is_fatal)
}
