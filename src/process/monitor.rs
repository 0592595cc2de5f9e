//! # Process Monitor
//!
//! Background poller over the processes a task has handed off for
//! supervision. A process that exits abnormally, or a stream connector
//! whose status snapshot stops moving, is removed and its failure routed by
//! kind. The message bus is probed on every tick while a stream phase is
//! active.
//!
//! The monitor never drives the job directly. Recovery that needs the
//! per-job lock is requested through [`MonitorEvent`]s.

use super::{ProcessKind, StreamDirection, Supervised, TaskProcess};
use crate::config::SupervisionConfig;
use crate::error::PortalError;
use crate::executor::StopIndicator;
use crate::state_machine::{MigrationStatus, StatusMonitor};
use crate::tools::MessageBus;
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Recovery requested from the migration manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Fail the task and stop everything
    StopOnError { reason: String },
    /// The bus was restarted underneath a running incremental stream
    RestartIncremental,
    /// The bus was restarted underneath a running reverse stream
    RestartReverse,
}

#[derive(Debug)]
struct Watched {
    process: Arc<TaskProcess>,
    last_modified: Option<SystemTime>,
    unchanged_ticks: u32,
}

impl Watched {
    /// Advance the staleness counter; true once the snapshot has not moved
    /// for `limit` ticks. A missing snapshot counts as movement.
    fn observe_snapshot(&mut self, limit: u32) -> bool {
        let Some(artifact) = self.process.status_artifact() else {
            return false;
        };
        let modified = artifact
            .latest()
            .and_then(|path| fs::metadata(path).ok())
            .and_then(|meta| meta.modified().ok());

        match modified {
            Some(modified) if self.last_modified == Some(modified) => {
                self.unchanged_ticks += 1;
            }
            other => {
                self.last_modified = other;
                self.unchanged_ticks = 0;
            }
        }
        self.unchanged_ticks >= limit
    }
}

#[derive(Debug)]
pub struct ProcessMonitor {
    status: Arc<StatusMonitor>,
    bus: Arc<dyn MessageBus>,
    supervision: SupervisionConfig,
    stop: StopIndicator,
    watched: Mutex<Vec<Watched>>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessMonitor {
    pub fn new(
        status: Arc<StatusMonitor>,
        bus: Arc<dyn MessageBus>,
        supervision: SupervisionConfig,
        stop: StopIndicator,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let monitor = Arc::new(Self {
            status,
            bus,
            supervision,
            stop,
            watched: Mutex::new(Vec::new()),
            events,
            shutdown,
            handle: Mutex::new(None),
        });
        (monitor, receiver)
    }

    /// Start supervising `process`; registering the same process twice is a no-op
    pub fn register(&self, process: Arc<TaskProcess>) {
        let mut watched = self.watched.lock();
        if watched.iter().any(|w| Arc::ptr_eq(&w.process, &process)) {
            return;
        }
        debug!(process = %process.name(), "Process registered with monitor");
        watched.push(Watched {
            process,
            last_modified: None,
            unchanged_ticks: 0,
        });
    }

    pub fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    fn unregister(&self, process: &Arc<TaskProcess>) {
        self.watched
            .lock()
            .retain(|w| !Arc::ptr_eq(&w.process, process));
    }

    /// Launch the polling loop
    pub fn spawn(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            info!("🩺 Process monitor started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(monitor.supervision.monitor_interval()) => {}
                    _ = shutdown.changed() => break,
                }
                monitor.tick().await;
            }
            info!("Process monitor stopped");
        }));
    }

    /// Stop the polling loop and forget every watched process
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Process monitor task ended abnormally");
            }
        }
        self.watched.lock().clear();
    }

    /// One supervision pass. At most one failure is handled per pass.
    pub async fn tick(&self) {
        let processes: Vec<Arc<TaskProcess>> = self
            .watched
            .lock()
            .iter()
            .map(|w| Arc::clone(&w.process))
            .collect();

        for process in processes {
            if !process.check_status().await {
                self.unregister(&process);
                self.handle_process_failure(&process);
                break;
            }

            if process.is_stopped() {
                self.unregister(&process);
                continue;
            }

            if process.kind().is_stream() && self.is_stale(&process) {
                warn!(
                    process = %process.name(),
                    ticks = self.supervision.stale_status_ticks,
                    "⏳ Status snapshot stopped moving, treating process as hung"
                );
                self.unregister(&process);
                process.stop().await;
                self.handle_process_failure(&process);
                break;
            }
        }

        let status = self.status.current_status();
        if status.is_full_migration() || status.is_not_running() {
            return;
        }
        if !self.bus.is_healthy().await {
            self.handle_bus_failure().await;
        }
    }

    fn is_stale(&self, process: &Arc<TaskProcess>) -> bool {
        let limit = self.supervision.stale_status_ticks;
        self.watched
            .lock()
            .iter_mut()
            .find(|w| Arc::ptr_eq(&w.process, process))
            .is_some_and(|w| w.observe_snapshot(limit))
    }

    fn handle_process_failure(&self, process: &TaskProcess) {
        error!(process = %process.name(), kind = ?process.kind(), "❌ Supervised process failed");
        match process.kind() {
            ProcessKind::FullDataCheck | ProcessKind::IncrementalDataCheck => {
                self.emit(MonitorEvent::StopOnError {
                    reason: format!("{} exited abnormally", process.name()),
                });
            }
            ProcessKind::Stream(StreamDirection::Incremental, _) => {
                if self.status.is_incremental_status() {
                    self.status
                        .set_current_status(MigrationStatus::IncrementalInterrupted);
                }
            }
            ProcessKind::Stream(StreamDirection::Reverse, _) => {
                if self.status.is_reverse_status() {
                    self.status
                        .set_current_status(MigrationStatus::ReverseInterrupted);
                }
            }
            ProcessKind::FullMigration => {
                debug!(process = %process.name(), "Full migration failures surface through the running step");
            }
        }
    }

    async fn handle_bus_failure(&self) {
        let status = self.status.current_status();
        if status.is_not_running() || status.is_full_migration() {
            return;
        }

        error!(status = %status, "❌ Message bus is down");
        if status.is_full_data_check() {
            self.emit(MonitorEvent::StopOnError {
                reason: "message bus is down during full data check".to_string(),
            });
            return;
        }

        match self.bus.restart(&self.stop).await {
            Ok(()) => {}
            Err(PortalError::Stopped) => return,
            Err(e) => {
                self.emit(MonitorEvent::StopOnError {
                    reason: e.to_string(),
                });
                return;
            }
        }

        let status = self.status.current_status();
        if status.is_incremental() && !is_winding_down(status) {
            self.emit(MonitorEvent::RestartIncremental);
        } else if status.is_reverse() && !is_winding_down(status) {
            self.emit(MonitorEvent::RestartReverse);
        }
    }

    fn emit(&self, event: MonitorEvent) {
        debug!(event = ?event, "Monitor event");
        if self.events.send(event).is_err() {
            warn!("Monitor event receiver dropped");
        }
    }
}

fn is_winding_down(status: MigrationStatus) -> bool {
    status.is_stopping()
        || matches!(
            status,
            MigrationStatus::IncrementalFinished | MigrationStatus::ReverseFinished
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ExitPolicy, LaunchSpec, StatusArtifact, StreamSide};
    use crate::test_helpers::{FakeBus, FakeProcessTable};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        status: Arc<StatusMonitor>,
        bus: Arc<FakeBus>,
        table: Arc<FakeProcessTable>,
        monitor: Arc<ProcessMonitor>,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
        stop: StopIndicator,
    }

    fn fixture(initial: MigrationStatus) -> Fixture {
        let dir = TempDir::new().unwrap();
        let status = Arc::new(StatusMonitor::load(dir.path().join("migration-status.txt")).unwrap());
        status.set_current_status(initial);
        let bus = Arc::new(FakeBus::new());
        let supervision = SupervisionConfig {
            stale_status_ticks: 3,
            ..SupervisionConfig::default()
        };
        let stop = StopIndicator::new();
        let (monitor, events) =
            ProcessMonitor::new(status.clone(), bus.clone(), supervision, stop.clone());
        Fixture {
            _dir: dir,
            stop,
            status,
            bus,
            table: Arc::new(FakeProcessTable::new()),
            monitor,
            events,
        }
    }

    fn connector(fixture: &Fixture, dir: &std::path::Path, direction: StreamDirection) -> Arc<TaskProcess> {
        let snippet = format!("{direction:?}-sink.properties");
        Arc::new(
            TaskProcess::new(
                "sink connector",
                ProcessKind::Stream(direction, StreamSide::Sink),
                LaunchSpec::new(format!("connect {snippet}"), dir, dir.join("connect.log")),
                snippet,
                ExitPolicy::Streaming,
                fixture.table.clone(),
                SupervisionConfig::default(),
            )
            .with_status_artifact(StatusArtifact {
                dir: dir.to_path_buf(),
                prefix: "forward-sink-process".into(),
            }),
        )
    }

    fn checker(fixture: &Fixture, dir: &std::path::Path) -> Arc<TaskProcess> {
        Arc::new(TaskProcess::new(
            "incremental data check sink",
            ProcessKind::IncrementalDataCheck,
            LaunchSpec::new("checker application-sink.yml", dir, dir.join("check.log")),
            "application-sink.yml",
            ExitPolicy::Background,
            fixture.table.clone(),
            SupervisionConfig::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_connector_interrupts_incremental() {
        let fx = fixture(MigrationStatus::IncrementalRunning);
        let dir = TempDir::new().unwrap();
        let process = connector(&fx, dir.path(), StreamDirection::Incremental);
        process.start().await.unwrap();
        fx.monitor.register(process.clone());

        fx.monitor.tick().await;
        assert_eq!(fx.monitor.watched_count(), 1);

        fx.table.exit(process.check_snippet());
        fx.monitor.tick().await;

        assert_eq!(fx.monitor.watched_count(), 0);
        assert_eq!(
            fx.status.current_status(),
            MigrationStatus::IncrementalInterrupted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reverse_failure_ignored_outside_reverse() {
        let fx = fixture(MigrationStatus::IncrementalFinished);
        let dir = TempDir::new().unwrap();
        let process = connector(&fx, dir.path(), StreamDirection::Reverse);
        process.start().await.unwrap();
        fx.monitor.register(process.clone());

        fx.table.exit(process.check_snippet());
        fx.monitor.tick().await;

        assert_eq!(
            fx.status.current_status(),
            MigrationStatus::IncrementalFinished
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_checker_failure_requests_stop_on_error() {
        let mut fx = fixture(MigrationStatus::IncrementalRunning);
        let dir = TempDir::new().unwrap();
        let process = checker(&fx, dir.path());
        process.start().await.unwrap();
        fx.monitor.register(process.clone());

        fx.table.exit(process.check_snippet());
        fx.monitor.tick().await;

        assert!(matches!(
            fx.events.try_recv().unwrap(),
            MonitorEvent::StopOnError { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_snapshot_stops_connector() {
        let fx = fixture(MigrationStatus::IncrementalRunning);
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("forward-sink-process_1.txt"), "{}").unwrap();
        let process = connector(&fx, dir.path(), StreamDirection::Incremental);
        process.start().await.unwrap();
        fx.monitor.register(process.clone());

        // First tick records the timestamp, the next three see no movement
        for _ in 0..3 {
            fx.monitor.tick().await;
            assert_eq!(fx.monitor.watched_count(), 1);
        }
        fx.monitor.tick().await;

        assert_eq!(fx.monitor.watched_count(), 0);
        assert!(process.is_stopped());
        assert!(!process.is_alive().await);
        assert_eq!(
            fx.status.current_status(),
            MigrationStatus::IncrementalInterrupted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_snapshot_is_not_stale() {
        let fx = fixture(MigrationStatus::IncrementalRunning);
        let dir = TempDir::new().unwrap();
        let process = connector(&fx, dir.path(), StreamDirection::Incremental);
        process.start().await.unwrap();
        fx.monitor.register(process);

        for _ in 0..10 {
            fx.monitor.tick().await;
        }
        assert_eq!(fx.monitor.watched_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_restart_requests_stream_restart() {
        let mut fx = fixture(MigrationStatus::ReverseRunning);
        fx.bus.set_healthy(false);

        fx.monitor.tick().await;

        assert_eq!(fx.bus.start_calls(), 1);
        assert_eq!(fx.events.try_recv().unwrap(), MonitorEvent::RestartReverse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_restart_failure_stops_task() {
        let mut fx = fixture(MigrationStatus::IncrementalRunning);
        fx.bus.set_healthy(false);
        fx.bus.fail_starts(u32::MAX);

        fx.monitor.tick().await;

        assert!(matches!(
            fx.events.try_recv().unwrap(),
            MonitorEvent::StopOnError { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_restart_skipped_once_task_stops() {
        let mut fx = fixture(MigrationStatus::IncrementalRunning);
        fx.bus.set_healthy(false);
        fx.stop.set();

        fx.monitor.tick().await;

        assert_eq!(fx.bus.start_calls(), 0);
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_ignored_during_full_migration() {
        let mut fx = fixture(MigrationStatus::FullMigrationRunning);
        fx.bus.set_healthy(false);

        fx.monitor.tick().await;

        assert_eq!(fx.bus.start_calls(), 0);
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_stops_cleanly() {
        let fx = fixture(MigrationStatus::IncrementalRunning);
        let dir = TempDir::new().unwrap();
        let process = connector(&fx, dir.path(), StreamDirection::Incremental);
        process.start().await.unwrap();
        fx.monitor.register(process.clone());
        fx.monitor.spawn();

        fx.table.exit(process.check_snippet());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            fx.status.current_status(),
            MigrationStatus::IncrementalInterrupted
        );

        fx.monitor.stop().await;
        assert_eq!(fx.monitor.watched_count(), 0);
    }
}
