//! # Migration Manager
//!
//! Top-level lifecycle of one migration task: the start sequence, the
//! task-wide stop, failure handling and routing of operator commands to the
//! [`MigrationJob`]. The manager also owns the background monitors and turns
//! recovery requests from the process monitor into job operations.

use crate::config::{ModeManager, PortalConfig, SourceType};
use crate::error::{PortalError, PortalResult};
use crate::executor::{ExecutionOutcome, StopIndicator};
use crate::job::{JobResources, MigrationJob};
use crate::process::adapters::ProcessFactory;
use crate::process::os::{ProcessTable, SystemProcessTable};
use crate::process::{MonitorEvent, ProcessMonitor};
use crate::progress::{Heartbeat, PhaseReaders, ProgressMonitor, VectorProgress};
use crate::report::StatusReport;
use crate::state_machine::{
    MigrationPhase, MigrationStatus, OperatorCommand, StatusMonitor, TransitionDecision,
};
use crate::tasks::TaskContext;
use crate::tools::{DatabaseAdmin, KafkaBus, MessageBus, PgDatabaseAdmin};
use crate::workspace::TaskWorkspace;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// External boundaries a manager drives
#[derive(Debug, Clone)]
pub struct ManagerServices {
    pub table: Arc<dyn ProcessTable>,
    pub bus: Arc<dyn MessageBus>,
    pub target_admin: Arc<dyn DatabaseAdmin>,
    pub source_admin: Option<Arc<dyn DatabaseAdmin>>,
}

impl ManagerServices {
    /// Services backed by the OS process table, the configured bus and `sqlx` pools
    pub fn connect(config: &PortalConfig) -> PortalResult<Self> {
        let table: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable::new());
        let bus = Arc::new(KafkaBus::new(
            config.bus.clone(),
            config.supervision.clone(),
            Arc::clone(&table),
        ));
        let target_admin = Arc::new(PgDatabaseAdmin::connect_lazy(&config.target_database)?);
        let source_admin: Option<Arc<dyn DatabaseAdmin>> = match config.migration.source_type {
            SourceType::Postgresql => Some(Arc::new(PgDatabaseAdmin::connect_lazy(
                &config.source_database,
            )?)),
            SourceType::Mysql | SourceType::Milvus => None,
        };
        Ok(Self {
            table,
            bus,
            target_admin,
            source_admin,
        })
    }
}

/// Fail before anything starts when an engine the job needs is not installed
pub fn verify_installation(config: &PortalConfig, phases: &[MigrationPhase]) -> PortalResult<()> {
    let tools = &config.tools;
    let mut required: Vec<(&str, &Path)> = Vec::new();

    if phases.contains(&MigrationPhase::FullMigration) {
        match config.migration.source_type {
            SourceType::Mysql => required.push(("full copy engine", tools.full_copy_home.as_path())),
            SourceType::Postgresql => {
                required.push(("full replicate tool", tools.full_replicate_jar.as_path()))
            }
            SourceType::Milvus => {}
        }
    }
    if phases
        .iter()
        .any(|p| matches!(p, MigrationPhase::FullDataCheck | MigrationPhase::IncrementalDataCheck))
    {
        required.push(("data checker", tools.data_checker_home.as_path()));
    }
    if phases
        .iter()
        .any(|p| matches!(p, MigrationPhase::IncrementalMigration | MigrationPhase::ReverseMigration))
    {
        required.push(("stream connector", tools.connector_home.as_path()));
        required.push(("message bus", config.bus.home.as_path()));
    }

    for (tool, path) in required {
        if !path.exists() {
            return Err(PortalError::PreconditionFailed(format!(
                "{tool} is not installed at {}",
                path.display()
            )));
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct MigrationManager {
    config: Arc<PortalConfig>,
    workspace: TaskWorkspace,
    status: Arc<StatusMonitor>,
    stop: StopIndicator,
    job: Arc<MigrationJob>,
    process_monitor: Arc<ProcessMonitor>,
    progress_monitor: Arc<ProgressMonitor>,
    heartbeat: Mutex<Option<Heartbeat>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MonitorEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    finished: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl MigrationManager {
    /// Build a manager against the real process table, bus and databases
    pub fn connect(config: Arc<PortalConfig>) -> PortalResult<Arc<Self>> {
        let services = ManagerServices::connect(&config)?;
        let manager = Self::with_services(config, services)?;
        verify_installation(&manager.config, manager.job.phases())?;
        Ok(manager)
    }

    pub fn with_services(config: Arc<PortalConfig>, services: ManagerServices) -> PortalResult<Arc<Self>> {
        config.validate()?;
        let mode = ModeManager::new(&config.workspace.data_dir).get(&config.migration.mode)?;

        let workspace = TaskWorkspace::new(&config.workspace.root, config.migration.task_id.clone());
        workspace.create()?;

        let status = Arc::new(StatusMonitor::load(workspace.migration_status_file())?);
        let stop = StopIndicator::new();
        let (process_monitor, events) = ProcessMonitor::new(
            Arc::clone(&status),
            Arc::clone(&services.bus),
            config.supervision.clone(),
            stop.clone(),
        );

        let ctx = TaskContext {
            factory: ProcessFactory::new(Arc::clone(&config), workspace.clone(), services.table),
            stop: stop.clone(),
            bus: services.bus,
            monitor: Arc::clone(&process_monitor),
        };

        let vector_progress = Arc::new(VectorProgress::new());
        let job = Arc::new(MigrationJob::new(
            ctx,
            &mode,
            Arc::clone(&status),
            JobResources {
                target_admin: services.target_admin,
                source_admin: services.source_admin,
                vector_progress: Arc::clone(&vector_progress),
            },
        ));

        let mut readers = PhaseReaders::new(workspace.clone(), config.migration.source_type);
        if config.migration.source_type == SourceType::Milvus {
            readers = readers.with_vector_progress(vector_progress);
        }
        let progress_monitor = ProgressMonitor::new(Arc::clone(&status), readers, &config.progress);
        let (shutdown, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            workspace,
            status,
            stop,
            job,
            process_monitor,
            progress_monitor,
            heartbeat: Mutex::new(None),
            events: Mutex::new(Some(events)),
            event_loop: Mutex::new(None),
            shutdown,
            finished,
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn job(&self) -> &Arc<MigrationJob> {
        &self.job
    }

    pub fn workspace(&self) -> &TaskWorkspace {
        &self.workspace
    }

    pub fn current_status(&self) -> MigrationStatus {
        self.status.current_status()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn set_status(&self, status: MigrationStatus) {
        if !self.status.set_current_status(status) {
            warn!(status = %status, "Status change refused");
        }
    }

    /// Run the start sequence of the task.
    ///
    /// Returns once every non-streaming phase is done; streaming phases keep
    /// running until an operator command or [`Self::stop`] ends them. A
    /// failure anywhere in the pipeline fails and stops the whole task.
    pub async fn start(self: &Arc<Self>) -> PortalResult<()> {
        let current = self.status.current_status();
        if current != MigrationStatus::NotStarted {
            return Err(PortalError::PreconditionFailed(format!(
                "task {} was already started, current status: {}",
                self.workspace.id(),
                current.description()
            )));
        }

        info!(task_id = %self.workspace.id(), mode = %self.config.migration.mode, "🚀 Starting migration");
        self.set_status(MigrationStatus::MigrationStarting);

        if !self.job.pre_migration_verify().await {
            self.stopped.store(true, Ordering::Release);
            self.stop.set();
            self.set_status(MigrationStatus::PreMigrationVerifyFailed);
            self.notify_stopped();
            return Err(PortalError::PreconditionFailed(
                "pre-migration verification failed".to_string(),
            ));
        }

        self.start_monitors();

        if let Err(e) = self.run_job().await {
            error!(task_id = %self.workspace.id(), error = %e, "❌ Migration task failed");
            self.stop_on_error(&e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn run_job(&self) -> PortalResult<()> {
        self.job.before_task().await?;
        let outcome = self.job.start_task().await?;

        let streaming = self.job.has_phase(MigrationPhase::IncrementalMigration)
            || self.job.has_phase(MigrationPhase::ReverseMigration);
        match outcome {
            ExecutionOutcome::Completed if !streaming => {
                info!(task_id = %self.workspace.id(), "All migration phases finished");
                self.stop().await;
            }
            ExecutionOutcome::Completed => {
                info!(task_id = %self.workspace.id(), "Streaming phases running, waiting for operator commands");
            }
            ExecutionOutcome::Cancelled { at } => {
                info!(task_id = %self.workspace.id(), step = at, "Start pipeline cancelled");
            }
        }
        Ok(())
    }

    fn start_monitors(self: &Arc<Self>) {
        self.process_monitor.spawn();
        self.progress_monitor.spawn();
        *self.heartbeat.lock() = Some(Heartbeat::spawn(
            self.workspace.heartbeat_file(),
            self.config.progress.heartbeat_interval(),
        ));
        self.spawn_event_loop();
    }

    /// Forward monitor events to their handlers, each on its own task so a
    /// handler that stops the manager never waits on this loop
    fn spawn_event_loop(self: &Arc<Self>) {
        let Some(mut events) = self.events.lock().take() else {
            return;
        };
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *self.event_loop.lock() = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            let handler = Arc::clone(&manager);
                            tokio::spawn(async move { handler.handle_event(event).await });
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    pub async fn handle_event(&self, event: MonitorEvent) {
        info!(task_id = %self.workspace.id(), event = ?event, "Handling monitor event");
        let outcome = match event {
            MonitorEvent::StopOnError { reason } => {
                self.stop_on_error(&reason).await;
                return;
            }
            MonitorEvent::RestartIncremental => self.job.restart_incremental().await,
            MonitorEvent::RestartReverse => self.job.restart_reverse().await,
        };
        if let Err(e) = outcome {
            error!(error = %e, "❌ Recovery after monitor event failed");
            self.stop_on_error(&e.to_string()).await;
        }
    }

    /// Stop every phase, release external state and finish the task.
    /// Only the first stop or failure has any effect.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            info!(task_id = %self.workspace.id(), "Migration task already stopped");
            return;
        }
        self.set_status(MigrationStatus::MigrationStopping);
        self.teardown().await;
        self.set_status(MigrationStatus::MigrationFinished);
        info!(task_id = %self.workspace.id(), "🏁 Migration finished");
    }

    pub async fn stop_on_error(&self, reason: &str) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            warn!(task_id = %self.workspace.id(), reason = %reason, "Task already stopped, ignoring failure");
            return;
        }
        error!(task_id = %self.workspace.id(), reason = %reason, "❌ Stopping migration on error");
        self.set_status(MigrationStatus::MigrationFailed);
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.stop.set();
        self.job.stop_task().await;

        self.shutdown.send_replace(true);
        let event_loop = self.event_loop.lock().take();
        if let Some(handle) = event_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor event loop ended abnormally");
            }
        }
        self.process_monitor.stop().await;
        self.progress_monitor.stop().await;
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }
        self.notify_stopped();
    }

    fn notify_stopped(&self) {
        self.finished.send_replace(true);
    }

    /// Resolve once the task has stopped and torn down, for whatever reason
    pub async fn wait_stopped(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    pub fn status(&self, detail: bool) -> PortalResult<String> {
        StatusReport::new(self.workspace.clone(), self.config.migration.source_type).render(detail)
    }

    /// Serve one operator command and describe the result for the operator
    pub async fn execute(self: &Arc<Self>, command: OperatorCommand) -> PortalResult<String> {
        let decision = match command {
            OperatorCommand::Start => {
                return Err(PortalError::unsupported("running migration task", "start"));
            }
            OperatorCommand::Stop => {
                self.stop().await;
                return Ok(format!("Migration task {} stopped", self.workspace.id()));
            }
            OperatorCommand::Status { detail } => return self.status(detail),
            OperatorCommand::StopIncremental => self.job.stop_incremental().await?,
            OperatorCommand::ResumeIncremental => self.job.resume_incremental().await?,
            OperatorCommand::RestartIncremental => self.job.restart_incremental().await?,
            OperatorCommand::StartReverse => self.job.start_reverse().await?,
            OperatorCommand::StopReverse => self.job.stop_reverse().await?,
            OperatorCommand::ResumeReverse => self.job.resume_reverse().await?,
            OperatorCommand::RestartReverse => self.job.restart_reverse().await?,
        };

        Ok(match decision {
            TransitionDecision::Rejected(rejection) => {
                format!("{command} rejected: {rejection}")
            }
            TransitionDecision::Allowed | TransitionDecision::AllowedAfterStop => format!(
                "{command} done, current status: {}",
                self.status.current_status().description()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeBus, FakeDatabaseAdmin, FakeProcessTable};
    use tempfile::TempDir;

    fn config(root: &Path, mode: &str) -> Arc<PortalConfig> {
        let mut config = PortalConfig::default();
        config.migration.task_id = "9".into();
        config.migration.mode = mode.into();
        config.workspace.root = root.to_path_buf();
        config.workspace.data_dir = root.join("data");
        Arc::new(config)
    }

    fn services(table: &Arc<FakeProcessTable>, target: &Arc<FakeDatabaseAdmin>) -> ManagerServices {
        ManagerServices {
            table: table.clone(),
            bus: Arc::new(FakeBus::new()),
            target_admin: target.clone(),
            source_admin: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_verification_leaves_task_unstarted() {
        let root = TempDir::new().unwrap();
        let table = Arc::new(FakeProcessTable::new());
        let target = Arc::new(FakeDatabaseAdmin::new());
        target.fail_operation("ping");
        let manager = MigrationManager::with_services(config(root.path(), "plan1"), services(&table, &target)).unwrap();

        let err = manager.start().await.unwrap_err();

        assert!(matches!(err, PortalError::PreconditionFailed(_)));
        assert_eq!(manager.current_status(), MigrationStatus::PreMigrationVerifyFailed);
        assert!(table.spawned().is_empty());
        manager.wait_stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_refused() {
        let root = TempDir::new().unwrap();
        let table = Arc::new(FakeProcessTable::new());
        let target = Arc::new(FakeDatabaseAdmin::new());
        let manager = MigrationManager::with_services(config(root.path(), "plan1"), services(&table, &target)).unwrap();
        manager.status.set_current_status(MigrationStatus::FullMigrationRunning);

        assert!(matches!(
            manager.start().await,
            Err(PortalError::PreconditionFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_command_is_not_served() {
        let root = TempDir::new().unwrap();
        let table = Arc::new(FakeProcessTable::new());
        let target = Arc::new(FakeDatabaseAdmin::new());
        let manager = MigrationManager::with_services(config(root.path(), "plan1"), services(&table, &target)).unwrap();

        assert!(matches!(
            manager.execute(OperatorCommand::Start).await,
            Err(PortalError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_error_then_stop_keeps_failed_status() {
        let root = TempDir::new().unwrap();
        let table = Arc::new(FakeProcessTable::new());
        let target = Arc::new(FakeDatabaseAdmin::new());
        let manager = MigrationManager::with_services(config(root.path(), "plan1"), services(&table, &target)).unwrap();

        manager.stop_on_error("checker died").await;
        manager.stop().await;

        assert_eq!(manager.current_status(), MigrationStatus::MigrationFailed);
        assert!(manager.is_stopped());
    }

    #[test]
    fn test_installation_check_names_missing_tool() {
        let root = TempDir::new().unwrap();
        let mut config = PortalConfig::default();
        config.tools.full_copy_home = root.path().join("chameleon");
        config.tools.data_checker_home = root.path().join("datachecker");
        std::fs::create_dir_all(&config.tools.full_copy_home).unwrap();

        assert!(verify_installation(&config, &[MigrationPhase::FullMigration]).is_ok());
        let err = verify_installation(
            &config,
            &[MigrationPhase::FullMigration, MigrationPhase::FullDataCheck],
        )
        .unwrap_err();
        assert!(err.to_string().contains("data checker is not installed"));
    }
}
