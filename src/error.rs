//! Error types for the migration portal.
//!
//! Operator commands issued from an illegal state are not errors; they are
//! reported as rejected transitions. Everything here is a genuine failure of
//! configuration, preconditions, infrastructure or a supervised engine.

use crate::config::ConfigurationError;
use crate::state_machine::StateMachineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Failed to launch {name}: {reason}")]
    ProcessLaunch { name: String, reason: String },

    #[error("{name} exited abnormally")]
    ProcessAbnormalExit { name: String },

    #[error("{name} does not support {operation}")]
    UnsupportedOperation { name: String, operation: String },

    #[error("Failed to restart message bus after {attempts} attempts")]
    BusUnavailable { attempts: u32 },

    #[error("Migration task is stopping")]
    Stopped,

    #[error("Message bus error: {0}")]
    Bus(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortalError {
    pub fn launch(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ProcessLaunch {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn unsupported(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation {
            name: name.into(),
            operation: operation.into(),
        }
    }

    /// True for failures that must abort the whole task rather than one phase
    pub fn is_fatal_to_task(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::PreconditionFailed(_) | Self::BusUnavailable { .. }
        )
    }
}

pub type PortalResult<T> = Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PortalError::launch("full migration", "no such file");
        assert_eq!(err.to_string(), "Failed to launch full migration: no such file");

        let err = PortalError::unsupported("incremental source", "wait_exit");
        assert_eq!(err.to_string(), "incremental source does not support wait_exit");

        let err = PortalError::BusUnavailable { attempts: 3 };
        assert_eq!(err.to_string(), "Failed to restart message bus after 3 attempts");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PortalError::BusUnavailable { attempts: 3 }.is_fatal_to_task());
        assert!(PortalError::PreconditionFailed("missing tool".into()).is_fatal_to_task());
        assert!(!PortalError::ProcessAbnormalExit {
            name: "reverse sink".into()
        }
        .is_fatal_to_task());
    }
}
