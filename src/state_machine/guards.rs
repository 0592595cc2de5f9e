//! Transition legality for operator-issued phase operations.
//!
//! Legality is a pure function of the requested operation, the current
//! status and the set of phases the job's mode enables. A rejected
//! operation is reported back to the caller and logged as a warning; it
//! never fails the task.

use super::events::PhaseOperation;
use super::states::{MigrationPhase, MigrationStatus, PhaseState};
use std::fmt;

/// Outcome of a legality check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionDecision {
    /// Run the operation directly
    Allowed,
    /// The phase is live; stop it first, then run the operation
    AllowedAfterStop,
    Rejected(Rejection),
}

impl TransitionDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    PhaseDisabled {
        phase: MigrationPhase,
    },
    IllegalState {
        operation: PhaseOperation,
        phase: MigrationPhase,
        status: MigrationStatus,
    },
    PredecessorNotFinished {
        phase: MigrationPhase,
        required: MigrationStatus,
        status: MigrationStatus,
    },
    AlreadyInPhase {
        phase: MigrationPhase,
        status: MigrationStatus,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhaseDisabled { phase } => {
                write!(f, "{phase} is not enabled in the current migration mode")
            }
            Self::IllegalState {
                operation,
                phase,
                status,
            } => write!(f, "cannot {operation} {phase} while status is {status}"),
            Self::PredecessorNotFinished {
                phase,
                required,
                status,
            } => write!(
                f,
                "cannot start {phase} until status is {required}, current status is {status}"
            ),
            Self::AlreadyInPhase { phase, status } => {
                write!(f, "{phase} has already started, current status is {status}")
            }
        }
    }
}

/// Trait for the individual rules so each can be described in logs
pub trait TransitionGuard {
    fn check(
        &self,
        phase: MigrationPhase,
        status: MigrationStatus,
        enabled: &[MigrationPhase],
    ) -> TransitionDecision;

    fn description(&self) -> &'static str;
}

/// Stop is legal only from running or interrupted
pub struct StopGuard;

impl TransitionGuard for StopGuard {
    fn check(
        &self,
        phase: MigrationPhase,
        status: MigrationStatus,
        _enabled: &[MigrationPhase],
    ) -> TransitionDecision {
        match in_phase_state(phase, status) {
            Some(PhaseState::Running | PhaseState::Interrupted) => TransitionDecision::Allowed,
            _ => illegal(PhaseOperation::Stop, phase, status),
        }
    }

    fn description(&self) -> &'static str {
        "Phase must be running or interrupted to stop"
    }
}

/// Resume is legal only from interrupted
pub struct ResumeGuard;

impl TransitionGuard for ResumeGuard {
    fn check(
        &self,
        phase: MigrationPhase,
        status: MigrationStatus,
        _enabled: &[MigrationPhase],
    ) -> TransitionDecision {
        match in_phase_state(phase, status) {
            Some(PhaseState::Interrupted) => TransitionDecision::Allowed,
            _ => illegal(PhaseOperation::Resume, phase, status),
        }
    }

    fn description(&self) -> &'static str {
        "Phase must be interrupted to resume"
    }
}

/// Restart is legal from finished, and from running or interrupted after a stop
pub struct RestartGuard;

impl TransitionGuard for RestartGuard {
    fn check(
        &self,
        phase: MigrationPhase,
        status: MigrationStatus,
        _enabled: &[MigrationPhase],
    ) -> TransitionDecision {
        match in_phase_state(phase, status) {
            Some(PhaseState::Finished) => TransitionDecision::Allowed,
            Some(PhaseState::Running | PhaseState::Interrupted) => {
                TransitionDecision::AllowedAfterStop
            }
            _ => illegal(PhaseOperation::Restart, phase, status),
        }
    }

    fn description(&self) -> &'static str {
        "Phase must be finished, running or interrupted to restart"
    }
}

/// Start requires the immediately preceding enabled phase to be finished
pub struct StartGuard;

impl TransitionGuard for StartGuard {
    fn check(
        &self,
        phase: MigrationPhase,
        status: MigrationStatus,
        enabled: &[MigrationPhase],
    ) -> TransitionDecision {
        match in_phase_state(phase, status) {
            Some(PhaseState::VerifyFailed) => return TransitionDecision::Allowed,
            Some(_) => {
                return TransitionDecision::Rejected(Rejection::AlreadyInPhase { phase, status })
            }
            None => {}
        }

        match predecessor_finished_status(phase, enabled) {
            Some(required) if required != status => {
                TransitionDecision::Rejected(Rejection::PredecessorNotFinished {
                    phase,
                    required,
                    status,
                })
            }
            _ => TransitionDecision::Allowed,
        }
    }

    fn description(&self) -> &'static str {
        "Preceding enabled phase must be finished before starting"
    }
}

/// Evaluate an operator operation against the current status and mode
pub fn evaluate(
    operation: PhaseOperation,
    phase: MigrationPhase,
    status: MigrationStatus,
    enabled: &[MigrationPhase],
) -> TransitionDecision {
    if !enabled.contains(&phase) {
        return TransitionDecision::Rejected(Rejection::PhaseDisabled { phase });
    }

    let guard: &dyn TransitionGuard = match operation {
        PhaseOperation::Start => &StartGuard,
        PhaseOperation::Stop => &StopGuard,
        PhaseOperation::Resume => &ResumeGuard,
        PhaseOperation::Restart => &RestartGuard,
    };

    let decision = guard.check(phase, status, enabled);
    if let TransitionDecision::Rejected(ref rejection) = decision {
        tracing::debug!(
            operation = %operation,
            phase = %phase,
            status = %status,
            guard = guard.description(),
            reason = %rejection,
            "Transition rejected"
        );
    }
    decision
}

/// Finished status of the phase that must complete before `phase` may start.
///
/// The incremental data check never gates anything since it has no status
/// of its own.
pub fn predecessor_finished_status(
    phase: MigrationPhase,
    enabled: &[MigrationPhase],
) -> Option<MigrationStatus> {
    MigrationPhase::ALL
        .iter()
        .copied()
        .take_while(|candidate| *candidate != phase)
        .filter(|candidate| candidate.has_own_status() && enabled.contains(candidate))
        .last()
        .and_then(|predecessor| MigrationStatus::for_phase(predecessor, PhaseState::Finished))
}

fn in_phase_state(phase: MigrationPhase, status: MigrationStatus) -> Option<PhaseState> {
    status
        .phase_state()
        .filter(|(status_phase, _)| *status_phase == phase)
        .map(|(_, state)| state)
}

fn illegal(
    operation: PhaseOperation,
    phase: MigrationPhase,
    status: MigrationStatus,
) -> TransitionDecision {
    TransitionDecision::Rejected(Rejection::IllegalState {
        operation,
        phase,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use MigrationPhase::*;

    const PLAN3: [MigrationPhase; 5] = [
        FullMigration,
        FullDataCheck,
        IncrementalMigration,
        IncrementalDataCheck,
        ReverseMigration,
    ];

    #[test]
    fn test_resume_only_from_interrupted() {
        for status in MigrationStatus::ALL {
            let decision = evaluate(PhaseOperation::Resume, IncrementalMigration, status, &PLAN3);
            assert_eq!(
                decision.is_allowed(),
                status == MigrationStatus::IncrementalInterrupted,
                "unexpected decision for {status:?}"
            );
        }
    }

    #[test]
    fn test_restart_decisions() {
        assert_eq!(
            evaluate(
                PhaseOperation::Restart,
                ReverseMigration,
                MigrationStatus::ReverseFinished,
                &PLAN3
            ),
            TransitionDecision::Allowed
        );
        assert_eq!(
            evaluate(
                PhaseOperation::Restart,
                ReverseMigration,
                MigrationStatus::ReverseRunning,
                &PLAN3
            ),
            TransitionDecision::AllowedAfterStop
        );
        assert!(!evaluate(
            PhaseOperation::Restart,
            ReverseMigration,
            MigrationStatus::ReverseStarting,
            &PLAN3
        )
        .is_allowed());
    }

    #[test]
    fn test_stop_reverse_when_finished_is_rejected() {
        let decision = evaluate(
            PhaseOperation::Stop,
            ReverseMigration,
            MigrationStatus::ReverseFinished,
            &PLAN3,
        );
        assert!(matches!(
            decision,
            TransitionDecision::Rejected(Rejection::IllegalState { .. })
        ));
    }

    #[test]
    fn test_disabled_phase_rejected() {
        let enabled = [FullMigration, FullDataCheck];
        let decision = evaluate(
            PhaseOperation::Stop,
            IncrementalMigration,
            MigrationStatus::IncrementalRunning,
            &enabled,
        );
        assert_eq!(
            decision,
            TransitionDecision::Rejected(Rejection::PhaseDisabled {
                phase: IncrementalMigration
            })
        );
    }

    #[test]
    fn test_reverse_predecessor() {
        assert_eq!(
            predecessor_finished_status(ReverseMigration, &PLAN3),
            Some(MigrationStatus::IncrementalFinished)
        );
        assert_eq!(
            predecessor_finished_status(ReverseMigration, &[FullMigration, FullDataCheck, ReverseMigration]),
            Some(MigrationStatus::FullDataCheckFinished)
        );
        assert_eq!(
            predecessor_finished_status(ReverseMigration, &[FullMigration, ReverseMigration]),
            Some(MigrationStatus::FullMigrationFinished)
        );
        assert_eq!(predecessor_finished_status(ReverseMigration, &[ReverseMigration]), None);
    }

    #[test]
    fn test_start_reverse() {
        assert!(evaluate(
            PhaseOperation::Start,
            ReverseMigration,
            MigrationStatus::IncrementalFinished,
            &PLAN3
        )
        .is_allowed());
        assert!(matches!(
            evaluate(
                PhaseOperation::Start,
                ReverseMigration,
                MigrationStatus::IncrementalRunning,
                &PLAN3
            ),
            TransitionDecision::Rejected(Rejection::PredecessorNotFinished { .. })
        ));
        assert!(matches!(
            evaluate(
                PhaseOperation::Start,
                ReverseMigration,
                MigrationStatus::ReverseRunning,
                &PLAN3
            ),
            TransitionDecision::Rejected(Rejection::AlreadyInPhase { .. })
        ));
        assert!(evaluate(
            PhaseOperation::Start,
            ReverseMigration,
            MigrationStatus::PreReverseVerifyFailed,
            &PLAN3
        )
        .is_allowed());
    }
}
