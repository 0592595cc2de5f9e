use thiserror::Error;

/// Errors raised while reading or persisting migration status
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Invalid migration status: {0}")]
    InvalidStatus(String),

    #[error("Failed to persist status to {path}: {reason}")]
    PersistenceFailed { path: String, reason: String },

    #[error("Status file {path} is corrupt: {reason}")]
    CorruptStatusFile { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
