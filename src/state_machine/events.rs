use super::states::MigrationPhase;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operations an operator can request against a single phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOperation {
    Start,
    Stop,
    Resume,
    Restart,
}

impl PhaseOperation {
    pub fn operation_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Resume => "resume",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for PhaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation_type())
    }
}

/// Commands accepted at the operator boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperatorCommand {
    Start,
    StopIncremental,
    ResumeIncremental,
    RestartIncremental,
    StartReverse,
    StopReverse,
    ResumeReverse,
    RestartReverse,
    Stop,
    Status { detail: bool },
}

impl OperatorCommand {
    /// The phase operation this command maps onto, if it targets a single phase
    pub fn phase_operation(&self) -> Option<(PhaseOperation, MigrationPhase)> {
        use MigrationPhase::{IncrementalMigration, ReverseMigration};
        match self {
            Self::StopIncremental => Some((PhaseOperation::Stop, IncrementalMigration)),
            Self::ResumeIncremental => Some((PhaseOperation::Resume, IncrementalMigration)),
            Self::RestartIncremental => Some((PhaseOperation::Restart, IncrementalMigration)),
            Self::StartReverse => Some((PhaseOperation::Start, ReverseMigration)),
            Self::StopReverse => Some((PhaseOperation::Stop, ReverseMigration)),
            Self::ResumeReverse => Some((PhaseOperation::Resume, ReverseMigration)),
            Self::RestartReverse => Some((PhaseOperation::Restart, ReverseMigration)),
            Self::Start | Self::Stop | Self::Status { .. } => None,
        }
    }

    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::StopIncremental => "stop_incremental",
            Self::ResumeIncremental => "resume_incremental",
            Self::RestartIncremental => "restart_incremental",
            Self::StartReverse => "start_reverse",
            Self::StopReverse => "stop_reverse",
            Self::ResumeReverse => "resume_reverse",
            Self::RestartReverse => "restart_reverse",
            Self::Stop => "stop",
            Self::Status { .. } => "status",
        }
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_mapping() {
        assert_eq!(
            OperatorCommand::ResumeIncremental.phase_operation(),
            Some((PhaseOperation::Resume, MigrationPhase::IncrementalMigration))
        );
        assert_eq!(
            OperatorCommand::StartReverse.phase_operation(),
            Some((PhaseOperation::Start, MigrationPhase::ReverseMigration))
        );
        assert_eq!(OperatorCommand::Stop.phase_operation(), None);
        assert_eq!(OperatorCommand::Status { detail: true }.to_string(), "status");
    }
}
