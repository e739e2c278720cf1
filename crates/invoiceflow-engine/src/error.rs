//! Engine error types.
//!
//! Two layers of failure are kept apart. [`StageError`] is what a stage
//! handler reports; the executor catches it, audits it and fails the
//! instance. [`EngineError`] is what the engine's public operations return
//! to their caller; it never changes instance state on its own.

use invoiceflow_store::StoreError;

use crate::stage::Stage;

/// Failure raised while a stage is executing.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// An external call kept failing after every allowed retry.
    #[error("transient failure calling `{call}` after {attempts} attempt(s): {message}")]
    Transient {
        call: String,
        attempts: u32,
        message: String,
    },

    /// The decision oracle did not answer within its deadline.
    #[error("decision oracle timed out after {attempts} attempt(s)")]
    OracleTimeout { attempts: u32 },

    /// The instance context is missing or carries malformed data.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A tool refused the request; retrying will not help.
    #[error("tool `{tool}` rejected the call: {message}")]
    ToolRejected { tool: String, message: String },

    /// Persistence failed underneath the stage. Not an instance failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StageError {
    /// Stable name recorded in audit payloads and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "TRANSIENT_TOOL_ERROR",
            Self::OracleTimeout { .. } => "ORACLE_TIMEOUT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ToolRejected { .. } => "TOOL_REJECTED",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("malformed stage data: {err}"))
    }
}

/// Unified error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The instance is not in the state the operation requires.
    /// Nothing was changed.
    #[error("state conflict on instance {instance_id}: {reason}")]
    StateConflict { instance_id: String, reason: String },

    #[error("unknown review: {0}")]
    UnknownReview(String),

    #[error("review already resolved: {0}")]
    AlreadyResolved(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Another execution unit is already driving this instance.
    #[error("instance {0} is already being executed")]
    AlreadyActive(String),

    /// A stage produced a transition its node does not allow.
    #[error("illegal transition from {from}: {to}")]
    IllegalTransition { from: Stage, to: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A spawned execution unit panicked or was cancelled.
    #[error("execution task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub(crate) fn conflict(instance_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StateConflict {
            instance_id: instance_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
