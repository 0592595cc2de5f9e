// Migration status state machine
//
// Status enumeration, phase mapping, operator transition guards and the
// persisted current-status record for one migration task.

pub mod errors;
pub mod events;
pub mod guards;
pub mod states;
pub mod status_monitor;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::{OperatorCommand, PhaseOperation};
pub use guards::{evaluate, Rejection, TransitionDecision, TransitionGuard};
pub use states::{MigrationPhase, MigrationStatus, PhaseState};
pub use status_monitor::{StatusMonitor, StatusRecord};
