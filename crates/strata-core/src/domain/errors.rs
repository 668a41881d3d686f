//! Error types.

use thiserror::Error;

use crate::ports::QueueError;

/// Errors surfaced to callers of the queue layer.
///
/// Soft failures (stale delivery handles, receive misses) never show up here;
/// they are logged where they happen.
#[derive(Debug, Error)]
pub enum StrataError {
    /// Invalid construction-time input or a backend queue that could not be
    /// set up. The queue is not usable.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("priority level {level} out of range 0..{levels}")]
    LevelOutOfRange { level: i64, levels: usize },

    #[error("backend error: {0}")]
    Backend(#[from] QueueError),

    /// Programmer error: a task used outside its lifecycle.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("attribute codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl StrataError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, StrataError::ContractViolation(_))
    }
}

pub type Result<T, E = StrataError> = std::result::Result<T, E>;
