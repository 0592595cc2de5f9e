//! Current migration status with durable history.
//!
//! The status file holds a JSON array of `{timestamp, status}` records. The
//! last record is the current status; a missing file means the task has not
//! started. Every accepted change rewrites the file so a restarted controller
//! picks up where the previous one left off.

use super::errors::{StateMachineError, StateMachineResult};
use super::states::MigrationStatus;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub status: MigrationStatus,
}

impl StatusRecord {
    pub fn now(status: MigrationStatus) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            status,
        }
    }
}

#[derive(Debug)]
pub struct StatusMonitor {
    path: PathBuf,
    records: RwLock<Vec<StatusRecord>>,
}

impl StatusMonitor {
    /// Load the status history from `path`, starting empty if the file is absent
    pub fn load(path: impl Into<PathBuf>) -> StateMachineResult<Self> {
        let path = path.into();
        let records = if path.is_file() {
            let contents =
                fs::read_to_string(&path).map_err(|e| StateMachineError::PersistenceFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&contents).map_err(|e| {
                    StateMachineError::CorruptStatusFile {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
        } else {
            Vec::new()
        };

        debug!(
            path = %path.display(),
            records = records.len(),
            "Loaded migration status history"
        );

        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> StatusRecord {
        self.records
            .read()
            .last()
            .copied()
            .unwrap_or_else(|| StatusRecord {
                timestamp: 0,
                status: MigrationStatus::NotStarted,
            })
    }

    pub fn current_status(&self) -> MigrationStatus {
        self.current().status
    }

    pub fn history(&self) -> Vec<StatusRecord> {
        self.records.read().clone()
    }

    /// Record a new current status.
    ///
    /// Returns `false` when the change is refused: nothing may follow
    /// `MigrationFailed`. A persistence failure keeps the in-memory status
    /// and is logged.
    pub fn set_current_status(&self, status: MigrationStatus) -> bool {
        let mut records = self.records.write();
        if records.last().map(|r| r.status) == Some(MigrationStatus::MigrationFailed) {
            warn!(
                requested = %status,
                "Migration has failed, ignoring status change"
            );
            return false;
        }

        records.push(StatusRecord::now(status));
        if let Err(e) = Self::persist(&self.path, &records) {
            error!(
                path = %self.path.display(),
                error = %e,
                "❌ Failed to persist migration status"
            );
        }
        drop(records);

        info!(code = status.code(), "📋 Migration status: {}", status.description());
        true
    }

    pub fn is_full_migration_status(&self) -> bool {
        self.current_status().is_full_migration()
    }

    pub fn is_full_data_check_status(&self) -> bool {
        self.current_status().is_full_data_check()
    }

    pub fn is_incremental_status(&self) -> bool {
        self.current_status().is_incremental()
    }

    pub fn is_reverse_status(&self) -> bool {
        self.current_status().is_reverse()
    }

    pub fn is_not_running(&self) -> bool {
        self.current_status().is_not_running()
    }

    fn persist(path: &Path, records: &[StatusRecord]) -> StateMachineResult<()> {
        let failed = |e: std::io::Error| StateMachineError::PersistenceFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(failed)?;
        }
        let json = serde_json::to_string(records)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(failed)?;
        fs::rename(&tmp, path).map_err(failed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_not_started() {
        let dir = TempDir::new().unwrap();
        let monitor = StatusMonitor::load(dir.path().join("migration-status.txt")).unwrap();
        assert_eq!(monitor.current_status(), MigrationStatus::NotStarted);
        assert!(monitor.history().is_empty());
    }

    #[test]
    fn test_status_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status").join("migration-status.txt");

        let monitor = StatusMonitor::load(&path).unwrap();
        assert!(monitor.set_current_status(MigrationStatus::MigrationStarting));
        assert!(monitor.set_current_status(MigrationStatus::FullMigrationRunning));

        let reloaded = StatusMonitor::load(&path).unwrap();
        assert_eq!(reloaded.current_status(), MigrationStatus::FullMigrationRunning);
        assert_eq!(reloaded.history().len(), 2);
        assert!(reloaded.is_full_migration_status());
    }

    #[test]
    fn test_failed_is_final() {
        let dir = TempDir::new().unwrap();
        let monitor = StatusMonitor::load(dir.path().join("migration-status.txt")).unwrap();
        monitor.set_current_status(MigrationStatus::MigrationFailed);

        assert!(!monitor.set_current_status(MigrationStatus::MigrationFinished));
        assert_eq!(monitor.current_status(), MigrationStatus::MigrationFailed);
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("migration-status.txt");
        fs::write(&path, "{not json").unwrap();

        let err = StatusMonitor::load(&path).unwrap_err();
        assert!(matches!(err, StateMachineError::CorruptStatusFile { .. }));
    }
}
