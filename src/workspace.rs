//! # Task Workspace
//!
//! Durable directory layout of one migration task. Every task lives in
//! `<root>/task_<id>` with `config/`, `logs/`, `status/` and `tmp/` trees,
//! each split per phase area. Engines write their native artifacts into
//! the workspace and the progress monitor publishes normalized records
//! next to them.

use crate::constants::files;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Per-phase subtree inside each workspace area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseArea {
    Full,
    FullDataCheck,
    Incremental,
    IncrementalDataCheck,
    Reverse,
}

impl PhaseArea {
    pub const ALL: [PhaseArea; 5] = [
        Self::Full,
        Self::FullDataCheck,
        Self::Incremental,
        Self::IncrementalDataCheck,
        Self::Reverse,
    ];

    pub fn relative_path(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::FullDataCheck => "data-check/full",
            Self::Incremental => "incremental",
            Self::IncrementalDataCheck => "data-check/incremental",
            Self::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskWorkspace {
    id: String,
    home: PathBuf,
}

impl TaskWorkspace {
    pub fn new(root: impl AsRef<Path>, task_id: impl Into<String>) -> Self {
        let id = task_id.into();
        let home = root.as_ref().join(format!("task_{id}"));
        Self { id, home }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Create the full directory layout; existing directories are kept
    pub fn create(&self) -> io::Result<()> {
        for area in [self.config_root(), self.logs_root(), self.status_root()] {
            for phase in PhaseArea::ALL {
                fs::create_dir_all(area.join(phase.relative_path()))?;
            }
        }
        fs::create_dir_all(self.tmp_dir())?;
        fs::create_dir_all(self.full_engine_status_dir())?;
        fs::create_dir_all(self.check_result_dir(PhaseArea::FullDataCheck))?;
        fs::create_dir_all(self.check_result_dir(PhaseArea::IncrementalDataCheck))?;

        info!(task_id = %self.id, home = %self.home.display(), "📁 Task workspace ready");
        Ok(())
    }

    /// Remove the workspace and everything in it
    pub fn delete(&self) -> io::Result<()> {
        if self.home.exists() {
            fs::remove_dir_all(&self.home)?;
            info!(task_id = %self.id, "🗑️ Task workspace deleted");
        }
        Ok(())
    }

    pub fn config_root(&self) -> PathBuf {
        self.home.join("config")
    }

    pub fn logs_root(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn status_root(&self) -> PathBuf {
        self.home.join("status")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.home.join("tmp")
    }

    pub fn config_dir(&self, area: PhaseArea) -> PathBuf {
        self.config_root().join(area.relative_path())
    }

    pub fn logs_dir(&self, area: PhaseArea) -> PathBuf {
        self.logs_root().join(area.relative_path())
    }

    pub fn status_dir(&self, area: PhaseArea) -> PathBuf {
        self.status_root().join(area.relative_path())
    }

    pub fn migration_status_file(&self) -> PathBuf {
        self.status_root().join(files::MIGRATION_STATUS)
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.status_root().join(files::HEARTBEAT)
    }

    // Full migration artifacts

    pub fn full_migration_log(&self) -> PathBuf {
        self.logs_dir(PhaseArea::Full).join(files::FULL_MIGRATION_LOG)
    }

    pub fn full_total_file(&self) -> PathBuf {
        self.status_dir(PhaseArea::Full).join(files::FULL_TOTAL)
    }

    /// Normalized record of one object kind, e.g. `status/full/table.txt`
    pub fn full_object_file(&self, kind: &str) -> PathBuf {
        self.status_dir(PhaseArea::Full).join(format!("{kind}.txt"))
    }

    pub fn full_success_file(&self) -> PathBuf {
        self.status_dir(PhaseArea::Full).join(files::SUCCESS_LIST)
    }

    pub fn full_failed_file(&self) -> PathBuf {
        self.status_dir(PhaseArea::Full).join(files::FAILED_LIST)
    }

    pub fn full_engine_status_dir(&self) -> PathBuf {
        self.status_dir(PhaseArea::Full).join(files::FULL_ENGINE_DIR)
    }

    /// Snapshot written by the replicate tool for one sub-command
    pub fn full_engine_status_file(&self, order: &str) -> PathBuf {
        self.full_engine_status_dir().join(format!("{order}.json"))
    }

    /// Snapshot written by the replica engine for one sub-command
    pub fn full_copy_status_file(&self, order: &str) -> PathBuf {
        self.full_engine_status_dir()
            .join(format!("data_default_{}_{order}.json", self.id))
    }

    /// Per-collection log of the vector migration tool
    pub fn collection_log(&self, collection: &str) -> PathBuf {
        self.logs_dir(PhaseArea::Full)
            .join(format!("migration_{collection}.log"))
    }

    // Data check artifacts

    pub fn check_result_dir(&self, area: PhaseArea) -> PathBuf {
        self.status_dir(area).join(files::CHECK_RESULT_DIR)
    }

    pub fn check_success_log(&self, area: PhaseArea) -> PathBuf {
        self.check_result_dir(area).join(files::CHECK_SUCCESS_LOG)
    }

    pub fn check_failed_log(&self, area: PhaseArea) -> PathBuf {
        self.check_result_dir(area).join(files::CHECK_FAILED_LOG)
    }

    pub fn check_sign_file(&self, area: PhaseArea) -> PathBuf {
        self.check_result_dir(area).join(files::CHECK_SIGN_FILE)
    }

    pub fn check_repair_file(&self, area: PhaseArea, schema: &str, table: &str) -> PathBuf {
        self.check_result_dir(area)
            .join(format!("repair_{schema}_{table}_0_0.txt"))
    }

    pub fn check_success_file(&self, area: PhaseArea) -> PathBuf {
        self.status_dir(area).join(files::SUCCESS_LIST)
    }

    pub fn check_failed_file(&self, area: PhaseArea) -> PathBuf {
        self.status_dir(area).join(files::FAILED_LIST)
    }

    // Stream artifacts

    pub fn incremental_status_file(&self) -> PathBuf {
        self.status_dir(PhaseArea::Incremental).join(files::INCREMENTAL_STATUS)
    }

    pub fn reverse_status_file(&self) -> PathBuf {
        self.status_dir(PhaseArea::Reverse).join(files::REVERSE_STATUS)
    }

    pub fn fail_sql_file(&self, area: PhaseArea) -> PathBuf {
        self.status_dir(area).join(files::FAIL_SQL)
    }

    /// Remove every entry inside `dir`, keeping the directory itself
    pub fn clear_dir(dir: &Path) -> io::Result<()> {
        if !dir.exists() {
            return fs::create_dir_all(dir);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        debug!(dir = %dir.display(), "Cleared directory");
        Ok(())
    }
}

/// Most recently modified file in `dir` whose name contains `prefix`.
///
/// Stream connectors roll their status snapshots into new files, so the
/// latest one is resolved on every read.
pub fn latest_status_file(dir: &Path, prefix: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut latest: Option<(SystemTime, PathBuf)> = None;

    for entry in entries.flatten() {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(prefix));
        if !matches || !path.is_file() {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if latest.as_ref().map_or(true, |(current, _)| modified > *current) {
            latest = Some((modified, path));
        }
    }

    latest.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_delete() {
        let root = TempDir::new().unwrap();
        let workspace = TaskWorkspace::new(root.path(), "42");
        assert_eq!(workspace.home(), root.path().join("task_42"));

        workspace.create().unwrap();
        assert!(workspace.status_dir(PhaseArea::IncrementalDataCheck).is_dir());
        assert!(workspace.logs_dir(PhaseArea::Reverse).is_dir());
        assert!(workspace.tmp_dir().is_dir());
        assert!(workspace.check_result_dir(PhaseArea::FullDataCheck).is_dir());

        workspace.delete().unwrap();
        assert!(!workspace.home().exists());
    }

    #[test]
    fn test_artifact_paths() {
        let workspace = TaskWorkspace::new("/data", "7");
        assert_eq!(
            workspace.migration_status_file(),
            PathBuf::from("/data/task_7/status/migration-status.txt")
        );
        assert_eq!(
            workspace.full_object_file("table"),
            PathBuf::from("/data/task_7/status/full/table.txt")
        );
        assert_eq!(
            workspace.check_failed_log(PhaseArea::FullDataCheck),
            PathBuf::from("/data/task_7/status/data-check/full/result/failed.log")
        );
        assert_eq!(
            workspace.check_repair_file(PhaseArea::FullDataCheck, "public", "t1"),
            PathBuf::from("/data/task_7/status/data-check/full/result/repair_public_t1_0_0.txt")
        );
    }

    #[test]
    fn test_clear_dir_keeps_directory() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("status");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();

        TaskWorkspace::clear_dir(&dir).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn test_latest_status_file() {
        let root = TempDir::new().unwrap();
        assert!(latest_status_file(root.path(), "forward-sink-process").is_none());

        let older = root.path().join("forward-sink-process_1.txt");
        fs::write(&older, "{}").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let newer = root.path().join("forward-sink-process_2.txt");
        fs::write(&newer, "{}").unwrap();
        fs::write(root.path().join("forward-source-process_3.txt"), "{}").unwrap();

        assert_eq!(latest_status_file(root.path(), "forward-sink-process"), Some(newer));
    }
}
