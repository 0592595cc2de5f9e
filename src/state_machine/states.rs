use serde::{Deserialize, Serialize};
use std::fmt;

/// The five phases a migration mode can enable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    FullMigration,
    FullDataCheck,
    IncrementalMigration,
    IncrementalDataCheck,
    ReverseMigration,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 5] = [
        Self::FullMigration,
        Self::FullDataCheck,
        Self::IncrementalMigration,
        Self::IncrementalDataCheck,
        Self::ReverseMigration,
    ];

    pub fn phase_name(&self) -> &'static str {
        match self {
            Self::FullMigration => "full_migration",
            Self::FullDataCheck => "full_data_check",
            Self::IncrementalMigration => "incremental_migration",
            Self::IncrementalDataCheck => "incremental_data_check",
            Self::ReverseMigration => "reverse_migration",
        }
    }

    /// Phases whose progress is reported by the progress monitor.
    /// The incremental data check runs alongside incremental migration and
    /// has no status of its own.
    pub fn has_own_status(&self) -> bool {
        !matches!(self, Self::IncrementalDataCheck)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase_name())
    }
}

impl std::str::FromStr for MigrationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "full_migration" => Ok(Self::FullMigration),
            "full_data_check" => Ok(Self::FullDataCheck),
            "incremental_migration" => Ok(Self::IncrementalMigration),
            "incremental_data_check" => Ok(Self::IncrementalDataCheck),
            "reverse_migration" => Ok(Self::ReverseMigration),
            other => Err(format!("Invalid migration phase: {other}")),
        }
    }
}

/// Position of a status inside its phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseState {
    Starting,
    Running,
    Stopping,
    Interrupted,
    Finished,
    VerifyFailed,
}

/// Every status a migration task can be in.
///
/// Numeric codes are stable and shown to operators; the serialized form in
/// the status file is the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    NotStarted,
    MigrationStarting,

    FullMigrationStarting,
    FullMigrationRunning,
    FullMigrationFinished,

    FullDataCheckStarting,
    FullDataCheckRunning,
    FullDataCheckFinished,

    IncrementalStarting,
    IncrementalRunning,
    IncrementalFinished,
    IncrementalStopping,
    IncrementalInterrupted,

    ReverseStarting,
    ReverseRunning,
    ReverseFinished,
    ReverseStopping,
    ReverseInterrupted,
    PreReverseVerifyFailed,

    MigrationFailed,
    MigrationFinished,
    MigrationStopping,
    PreMigrationVerifyFailed,
}

impl MigrationStatus {
    pub const ALL: [MigrationStatus; 23] = [
        Self::NotStarted,
        Self::MigrationStarting,
        Self::FullMigrationStarting,
        Self::FullMigrationRunning,
        Self::FullMigrationFinished,
        Self::FullDataCheckStarting,
        Self::FullDataCheckRunning,
        Self::FullDataCheckFinished,
        Self::IncrementalStarting,
        Self::IncrementalRunning,
        Self::IncrementalFinished,
        Self::IncrementalStopping,
        Self::IncrementalInterrupted,
        Self::ReverseStarting,
        Self::ReverseRunning,
        Self::ReverseFinished,
        Self::ReverseStopping,
        Self::ReverseInterrupted,
        Self::PreReverseVerifyFailed,
        Self::MigrationFailed,
        Self::MigrationFinished,
        Self::MigrationStopping,
        Self::PreMigrationVerifyFailed,
    ];

    pub fn code(&self) -> u16 {
        match self {
            Self::NotStarted => 0,
            Self::MigrationStarting => 1,
            Self::FullMigrationStarting => 100,
            Self::FullMigrationRunning => 101,
            Self::FullMigrationFinished => 102,
            Self::FullDataCheckStarting => 200,
            Self::FullDataCheckRunning => 201,
            Self::FullDataCheckFinished => 202,
            Self::IncrementalStarting => 300,
            Self::IncrementalRunning => 301,
            Self::IncrementalFinished => 302,
            Self::IncrementalStopping => 303,
            Self::ReverseStarting => 401,
            Self::ReverseRunning => 402,
            Self::ReverseFinished => 403,
            Self::ReverseStopping => 404,
            Self::MigrationFailed => 500,
            Self::IncrementalInterrupted => 501,
            Self::ReverseInterrupted => 502,
            Self::MigrationFinished => 600,
            Self::PreMigrationVerifyFailed => 601,
            Self::PreReverseVerifyFailed => 602,
            Self::MigrationStopping => 603,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|status| status.code() == code)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::NotStarted => "Migration not started",
            Self::MigrationStarting => "Migration starting",
            Self::FullMigrationStarting => "Full migration started",
            Self::FullMigrationRunning => "Full migration running",
            Self::FullMigrationFinished => "Full migration finished",
            Self::FullDataCheckStarting => "Full data check started",
            Self::FullDataCheckRunning => "Full data check running",
            Self::FullDataCheckFinished => "Full data check finished",
            Self::IncrementalStarting => "Incremental migration started",
            Self::IncrementalRunning => "Incremental migration running",
            Self::IncrementalFinished => "Incremental migration finished",
            Self::IncrementalStopping => "Incremental migration stopping",
            Self::IncrementalInterrupted => "Incremental migration interrupted",
            Self::ReverseStarting => "Reverse migration started",
            Self::ReverseRunning => "Reverse migration running",
            Self::ReverseFinished => "Reverse migration finished",
            Self::ReverseStopping => "Reverse migration stopping",
            Self::ReverseInterrupted => "Reverse migration interrupted",
            Self::PreReverseVerifyFailed => "Pre reverse phase verify failed",
            Self::MigrationFailed => "Migration failed",
            Self::MigrationFinished => "Migration finished",
            Self::MigrationStopping => "Migration stopping",
            Self::PreMigrationVerifyFailed => "Pre migration verify failed",
        }
    }

    /// Phase and in-phase position, `None` for task-level statuses
    pub fn phase_state(&self) -> Option<(MigrationPhase, PhaseState)> {
        use MigrationPhase::*;
        use PhaseState::*;

        let pair = match self {
            Self::FullMigrationStarting => (FullMigration, Starting),
            Self::FullMigrationRunning => (FullMigration, Running),
            Self::FullMigrationFinished => (FullMigration, Finished),
            Self::FullDataCheckStarting => (FullDataCheck, Starting),
            Self::FullDataCheckRunning => (FullDataCheck, Running),
            Self::FullDataCheckFinished => (FullDataCheck, Finished),
            Self::IncrementalStarting => (IncrementalMigration, Starting),
            Self::IncrementalRunning => (IncrementalMigration, Running),
            Self::IncrementalFinished => (IncrementalMigration, Finished),
            Self::IncrementalStopping => (IncrementalMigration, Stopping),
            Self::IncrementalInterrupted => (IncrementalMigration, Interrupted),
            Self::ReverseStarting => (ReverseMigration, Starting),
            Self::ReverseRunning => (ReverseMigration, Running),
            Self::ReverseFinished => (ReverseMigration, Finished),
            Self::ReverseStopping => (ReverseMigration, Stopping),
            Self::ReverseInterrupted => (ReverseMigration, Interrupted),
            Self::PreReverseVerifyFailed => (ReverseMigration, VerifyFailed),
            _ => return None,
        };
        Some(pair)
    }

    /// Inverse of [`phase_state`](Self::phase_state)
    pub fn for_phase(phase: MigrationPhase, state: PhaseState) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.phase_state() == Some((phase, state)))
    }

    /// Phase whose progress this status reports, used by the progress monitor
    pub fn phase(&self) -> Option<MigrationPhase> {
        self.phase_state()
            .filter(|(_, state)| *state != PhaseState::VerifyFailed)
            .map(|(phase, _)| phase)
    }

    pub fn is_full_migration(&self) -> bool {
        self.phase() == Some(MigrationPhase::FullMigration)
    }

    pub fn is_full_data_check(&self) -> bool {
        self.phase() == Some(MigrationPhase::FullDataCheck)
    }

    pub fn is_incremental(&self) -> bool {
        self.phase() == Some(MigrationPhase::IncrementalMigration)
    }

    pub fn is_reverse(&self) -> bool {
        self.phase() == Some(MigrationPhase::ReverseMigration)
    }

    /// Terminal statuses end the task; nothing follows them but a new task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::MigrationFinished | Self::MigrationFailed | Self::PreMigrationVerifyFailed
        )
    }

    pub fn is_stopping(&self) -> bool {
        matches!(
            self,
            Self::MigrationStopping | Self::IncrementalStopping | Self::ReverseStopping
        )
    }

    /// No engine is expected to be running in these statuses
    pub fn is_not_running(&self) -> bool {
        matches!(
            self,
            Self::NotStarted
                | Self::MigrationStarting
                | Self::MigrationStopping
                | Self::MigrationFinished
                | Self::MigrationFailed
                | Self::PreMigrationVerifyFailed
        )
    }
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(code) = s.trim().parse::<u16>() {
            return Self::from_code(code).ok_or_else(|| format!("Invalid migration status code: {code}"));
        }
        serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
            .map_err(|_| format!("Invalid migration status: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique_and_round_trip() {
        let mut codes: Vec<u16> = MigrationStatus::ALL.iter().map(|s| s.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), MigrationStatus::ALL.len());

        for status in MigrationStatus::ALL {
            assert_eq!(MigrationStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_phase_groups() {
        assert!(MigrationStatus::FullMigrationRunning.is_full_migration());
        assert!(MigrationStatus::FullDataCheckFinished.is_full_data_check());
        assert!(MigrationStatus::IncrementalInterrupted.is_incremental());
        assert!(MigrationStatus::IncrementalStopping.is_incremental());
        assert!(MigrationStatus::ReverseStopping.is_reverse());
        assert!(!MigrationStatus::PreReverseVerifyFailed.is_reverse());
        assert_eq!(MigrationStatus::MigrationStopping.phase(), None);
    }

    #[test]
    fn test_for_phase_inverse() {
        assert_eq!(
            MigrationStatus::for_phase(MigrationPhase::IncrementalMigration, PhaseState::Interrupted),
            Some(MigrationStatus::IncrementalInterrupted)
        );
        assert_eq!(
            MigrationStatus::for_phase(MigrationPhase::FullMigration, PhaseState::Interrupted),
            None
        );
    }

    #[test]
    fn test_not_running() {
        assert!(MigrationStatus::NotStarted.is_not_running());
        assert!(MigrationStatus::MigrationStopping.is_not_running());
        assert!(!MigrationStatus::IncrementalRunning.is_not_running());
    }

    #[test]
    fn test_parse_status() {
        assert_eq!("301".parse::<MigrationStatus>(), Ok(MigrationStatus::IncrementalRunning));
        assert_eq!(
            "reverse_interrupted".parse::<MigrationStatus>(),
            Ok(MigrationStatus::ReverseInterrupted)
        );
        assert!("999".parse::<MigrationStatus>().is_err());
        assert_eq!(
            "full_data_check".parse::<MigrationPhase>(),
            Ok(MigrationPhase::FullDataCheck)
        );
    }
}
