//! Error types for the flow engine.

use thiserror::Error;

use crate::protocol::EngineResponseStatus;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while loading, running, resuming or scheduling flows.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configs seeding received something other than a mapping or a list of pairs.
    #[error("Invalid configs input: {0}")]
    InvalidConfigsInput(String),

    /// A template reference did not resolve. Never fatal to a run.
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    /// The sandboxed worker did not complete normally.
    #[error("Sandbox fault ({status}): {message}")]
    SandboxFault {
        status: EngineResponseStatus,
        message: String,
    },

    /// A step reported its own failure.
    #[error("Step '{step}' failed: {message}")]
    StepFailure { step: String, message: String },

    /// A scheduled job could not be scheduled or processed.
    #[error("Scheduler job error: {0}")]
    SchedulerJob(String),

    /// Invalid flow definition.
    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    /// Flow version not found in the store.
    #[error("Flow version not found: {0}")]
    FlowNotFound(String),

    /// Run not found in the store.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// The run is not in a state that can be resumed.
    #[error("Run '{run_id}' cannot be resumed from status {status}")]
    RunNotResumable { run_id: String, status: String },

    /// Another interpreter currently owns the run.
    #[error("Run '{0}' is already being executed")]
    RunAlreadyActive(String),

    /// Execution state was addressed through an invalid path.
    #[error("Invalid execution state: {0}")]
    InvalidState(String),

    /// Piece catalog error.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Sandbox infrastructure error (engine side, not a guest fault).
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Run or flow store error.
    #[error("Store error: {0}")]
    Store(String),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl EngineError {
    /// Whether a step may absorb this error under continue-on-failure.
    pub fn is_step_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::SandboxFault { .. } | EngineError::StepFailure { .. }
        )
    }
}
