//! # Progress Monitor
//!
//! One background loop per task that maps the current migration status to
//! a phase and runs that phase's reader. When the phase changes between
//! two ticks the outgoing phase is read once more, so progress emitted right
//! at a phase boundary is still published. A stopping task keeps reading
//! the phase it was in; a finished or failed task gets one final read and
//! the loop ends.

pub mod cache;
pub mod heartbeat;
pub mod models;
pub mod readers;
pub mod vector;

pub use cache::ModifiedCache;
pub use heartbeat::Heartbeat;
pub use models::{
    CheckEntry, CheckFailEntry, FullEntry, FullTotalInfo, ObjectKind, StreamProgress,
};
pub use readers::PhaseReaders;
pub use vector::VectorProgress;

use crate::config::ProgressConfig;
use crate::state_machine::{MigrationPhase, MigrationStatus, StatusMonitor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct ProgressMonitor {
    status: Arc<StatusMonitor>,
    readers: PhaseReaders,
    interval: Duration,
    latest: Mutex<MigrationStatus>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Phase whose artifacts a status refers to, verify failures included
fn progress_phase(status: MigrationStatus) -> Option<MigrationPhase> {
    status.phase_state().map(|(phase, _)| phase)
}

impl ProgressMonitor {
    pub fn new(status: Arc<StatusMonitor>, readers: PhaseReaders, config: &ProgressConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            status,
            readers,
            interval: config.poll_interval(),
            latest: Mutex::new(MigrationStatus::NotStarted),
            shutdown,
            handle: Mutex::new(None),
        })
    }

    pub fn spawn(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            info!("📈 Progress monitor started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(monitor.interval) => {}
                    _ = shutdown.changed() => break,
                }
                if !monitor.tick() {
                    break;
                }
            }
            monitor.flush();
            info!("Progress monitor stopped");
        }));
    }

    /// Stop the loop; the last observed phase is read one final time
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Progress monitor task ended abnormally");
                }
            }
            None => self.flush(),
        }
    }

    pub fn readers(&self) -> &PhaseReaders {
        &self.readers
    }

    /// One poll; returns whether the loop should continue
    pub fn tick(&self) -> bool {
        let current = self.status.current_status();
        match current {
            MigrationStatus::NotStarted | MigrationStatus::MigrationStarting => return true,
            MigrationStatus::MigrationFailed
            | MigrationStatus::MigrationFinished
            | MigrationStatus::PreMigrationVerifyFailed => return false,
            _ => {}
        }

        let mut latest = self.latest.lock();
        let effective = if current == MigrationStatus::MigrationStopping {
            *latest
        } else {
            current
        };
        let Some(phase) = progress_phase(effective) else {
            return true;
        };

        self.readers.read_phase(phase);
        if *latest != MigrationStatus::NotStarted {
            if let Some(previous) = progress_phase(*latest).filter(|previous| *previous != phase) {
                debug!(from = %previous, to = %phase, "Phase changed, flushing previous phase");
                self.readers.read_phase(previous);
            }
        }
        *latest = effective;
        true
    }

    fn flush(&self) {
        let latest = *self.latest.lock();
        if let Some(phase) = progress_phase(latest) {
            self.readers.read_phase(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceType;
    use crate::workspace::{PhaseArea, TaskWorkspace};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        workspace: TaskWorkspace,
        status: Arc<StatusMonitor>,
        monitor: Arc<ProgressMonitor>,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let workspace = TaskWorkspace::new(root.path(), "5");
        workspace.create().unwrap();
        let status = Arc::new(StatusMonitor::load(workspace.migration_status_file()).unwrap());
        let monitor = ProgressMonitor::new(
            status.clone(),
            PhaseReaders::new(workspace.clone(), SourceType::Mysql),
            &ProgressConfig::default(),
        );
        Fixture {
            _root: root,
            workspace,
            status,
            monitor,
        }
    }

    fn write_stream_pair(workspace: &TaskWorkspace) {
        let dir = workspace.status_dir(PhaseArea::Incremental);
        fs::write(dir.join("forward-source-process_1.txt"), r#"{"speed":10}"#).unwrap();
        fs::write(
            dir.join("forward-sink-process_1.txt"),
            r#"{"replayedCount":7,"overallPipe":1}"#,
        )
        .unwrap();
    }

    #[test]
    fn test_idle_statuses_keep_polling() {
        let fx = fixture();
        assert!(fx.monitor.tick());
        fx.status.set_current_status(MigrationStatus::MigrationStarting);
        assert!(fx.monitor.tick());
    }

    #[test]
    fn test_terminal_status_ends_loop() {
        let fx = fixture();
        fx.status.set_current_status(MigrationStatus::MigrationFinished);
        assert!(!fx.monitor.tick());
    }

    #[test]
    fn test_phase_change_flushes_previous_phase() {
        let fx = fixture();
        fx.status.set_current_status(MigrationStatus::IncrementalRunning);
        assert!(fx.monitor.tick());

        // Final incremental numbers land after the switch to reverse
        write_stream_pair(&fx.workspace);
        fx.status.set_current_status(MigrationStatus::ReverseRunning);
        assert!(fx.monitor.tick());

        assert!(fx.workspace.incremental_status_file().exists());
    }

    #[test]
    fn test_stopping_reuses_last_phase() {
        let fx = fixture();
        fx.status.set_current_status(MigrationStatus::IncrementalRunning);
        fx.monitor.tick();

        fx.status.set_current_status(MigrationStatus::MigrationStopping);
        write_stream_pair(&fx.workspace);
        assert!(fx.monitor.tick());

        assert!(fx.workspace.incremental_status_file().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_flushes_latest_phase() {
        let fx = fixture();
        fx.status.set_current_status(MigrationStatus::IncrementalRunning);
        fx.monitor.spawn();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        write_stream_pair(&fx.workspace);
        fx.monitor.stop().await;

        assert!(fx.workspace.incremental_status_file().exists());
    }
}
