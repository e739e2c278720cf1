//! Error type shared by every store.

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A snapshot, payload or summary column did not round-trip through JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// Bad input, or a stored enum value this build does not know.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The blocking database task panicked, was cancelled, or found the
    /// connection mutex poisoned.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
