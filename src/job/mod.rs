//! # Migration Job
//!
//! One job per task. The job owns the phase tasks its mode enables, drives
//! the initial start pipeline through a [`TaskExecutor`], and serves the
//! operator's phase commands (see [`commands`]). Operator commands and
//! [`MigrationJob::stop_task`] are serialized by a per-job lock; the start
//! pipeline runs without it.
//!
//! External-state bracketing also lives here: the target's `fsync`
//! parameter around the whole job, and the one-time reverse preparation
//! (replica identity, slot and publication) before reverse replication.

pub mod commands;

use crate::config::{MigrationMode, SourceType};
use crate::constants::replication;
use crate::error::PortalResult;
use crate::executor::{ExecutionOutcome, TaskExecutor};
use crate::logging::log_cleanup_failure;
use crate::process::adapters::FullCopyTool;
use crate::process::{StreamDirection, StreamSide};
use crate::progress::VectorProgress;
use crate::state_machine::{MigrationPhase, MigrationStatus, StatusMonitor};
use crate::tasks::{
    CheckTask, CollectionTask, FullCopyTask, FullMigrationTask, PhaseTask, ReplicationObjects,
    StreamTask, TaskContext,
};
use crate::tools::DatabaseAdmin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Database and progress collaborators a job needs besides its [`TaskContext`]
#[derive(Debug, Clone)]
pub struct JobResources {
    pub target_admin: Arc<dyn DatabaseAdmin>,
    /// Only PostgreSQL sources are administered directly
    pub source_admin: Option<Arc<dyn DatabaseAdmin>>,
    pub vector_progress: Arc<VectorProgress>,
}

/// Phase tasks of one job; `None` for phases the mode leaves out
#[derive(Debug, Default)]
pub struct JobTasks {
    pub full: Option<Arc<FullMigrationTask>>,
    pub full_check: Option<Arc<CheckTask>>,
    pub incremental: Option<Arc<StreamTask>>,
    pub incremental_check: Option<Arc<CheckTask>>,
    pub reverse: Option<Arc<StreamTask>>,
}

/// Phases of `requested` that `source_type` can run, in mode order
pub fn supported_phases(source_type: SourceType, requested: &[MigrationPhase]) -> Vec<MigrationPhase> {
    requested
        .iter()
        .copied()
        .filter(|phase| {
            let supported = match source_type {
                SourceType::Mysql => true,
                SourceType::Postgresql => !matches!(
                    phase,
                    MigrationPhase::FullDataCheck | MigrationPhase::IncrementalDataCheck
                ),
                SourceType::Milvus => *phase == MigrationPhase::FullMigration,
            };
            if !supported {
                warn!(source_type = %source_type, phase = %phase, "Phase is not supported for this source, skipping");
            }
            supported
        })
        .collect()
}

#[derive(Debug)]
pub struct MigrationJob {
    ctx: TaskContext,
    status: Arc<StatusMonitor>,
    resources: JobResources,
    phases: Vec<MigrationPhase>,
    tasks: JobTasks,
    before_reverse_done: AtomicBool,
    kernel_adjusted: AtomicBool,
    task_stopped: AtomicBool,
    operations: Mutex<()>,
}

impl MigrationJob {
    pub fn new(
        ctx: TaskContext,
        mode: &MigrationMode,
        status: Arc<StatusMonitor>,
        resources: JobResources,
    ) -> Self {
        let config = ctx.factory.config();
        let source_type = config.migration.source_type;
        let phases = supported_phases(source_type, mode.phases());
        let tasks = Self::build_tasks(&ctx, &phases, &resources);

        info!(
            task_id = %ctx.workspace().id(),
            source_type = %source_type,
            mode = %mode.name,
            phases = ?phases,
            "🧭 Migration job created"
        );

        Self {
            ctx,
            status,
            resources,
            phases,
            tasks,
            before_reverse_done: AtomicBool::new(false),
            kernel_adjusted: AtomicBool::new(false),
            task_stopped: AtomicBool::new(false),
            operations: Mutex::new(()),
        }
    }

    fn build_tasks(ctx: &TaskContext, phases: &[MigrationPhase], resources: &JobResources) -> JobTasks {
        let config = ctx.factory.config();
        let source_type = config.migration.source_type;
        let task_id = ctx.workspace().id().to_string();
        let has = |phase| phases.contains(&phase);

        let full = has(MigrationPhase::FullMigration).then(|| {
            Arc::new(match source_type {
                SourceType::Mysql => FullMigrationTask::Copy(FullCopyTask::new(ctx.clone(), FullCopyTool::Replica)),
                SourceType::Postgresql => {
                    FullMigrationTask::Copy(FullCopyTask::new(ctx.clone(), FullCopyTool::Replicate))
                }
                SourceType::Milvus => FullMigrationTask::Collections(CollectionTask::new(
                    ctx.clone(),
                    config.migration.collections.clone(),
                    config.migration.collection_concurrency,
                    Arc::clone(&resources.vector_progress),
                )),
            })
        });

        let full_check = has(MigrationPhase::FullDataCheck).then(|| Arc::new(CheckTask::full(ctx.clone())));

        let incremental = has(MigrationPhase::IncrementalMigration).then(|| {
            let task = StreamTask::new(ctx.clone(), StreamDirection::Incremental);
            let task = match (&resources.source_admin, source_type) {
                (Some(admin), SourceType::Postgresql) => task.with_replication(ReplicationObjects::release_only(
                    Arc::clone(admin),
                    format!("slot_{task_id}"),
                )),
                _ => task,
            };
            Arc::new(task)
        });

        let incremental_check = (has(MigrationPhase::IncrementalMigration)
            && has(MigrationPhase::IncrementalDataCheck))
        .then(|| Arc::new(CheckTask::incremental(ctx.clone())));

        let reverse = has(MigrationPhase::ReverseMigration).then(|| {
            let mut schemas = config.target_database.schemas.clone();
            if schemas.is_empty() {
                schemas.push(config.source_database.database.clone());
            }
            let (_, connector) = ctx
                .factory
                .connector_config_files(StreamDirection::Reverse, StreamSide::Source);
            Arc::new(
                StreamTask::new(ctx.clone(), StreamDirection::Reverse).with_replication(
                    ReplicationObjects::managed(
                        Arc::clone(&resources.target_admin),
                        schemas,
                        format!("{}_{task_id}", replication::SLOT_PREFIX),
                        connector,
                    ),
                ),
            )
        });

        JobTasks {
            full,
            full_check,
            incremental,
            incremental_check,
            reverse,
        }
    }

    pub fn phases(&self) -> &[MigrationPhase] {
        &self.phases
    }

    pub fn has_phase(&self, phase: MigrationPhase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn tasks(&self) -> &JobTasks {
        &self.tasks
    }

    pub fn status(&self) -> &Arc<StatusMonitor> {
        &self.status
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    fn task_id(&self) -> &str {
        self.ctx.workspace().id()
    }

    fn source_type(&self) -> SourceType {
        self.ctx.factory.config().migration.source_type
    }

    pub(crate) fn set_status(&self, status: MigrationStatus) {
        if !self.status.set_current_status(status) {
            warn!(status = %status, "Status change refused");
        }
    }

    /// Verify the databases are reachable and ready for every enabled phase
    pub async fn pre_migration_verify(&self) -> bool {
        if let Err(e) = self.resources.target_admin.ping().await {
            error!(error = %e, "❌ Target database is not reachable");
            return false;
        }
        if let Some(source) = &self.resources.source_admin {
            if let Err(e) = source.ping().await {
                error!(error = %e, "❌ Source database is not reachable");
                return false;
            }
        }
        if self.has_phase(MigrationPhase::ReverseMigration) && !self.verify_reverse().await {
            return false;
        }
        info!(task_id = %self.task_id(), "✅ Pre-migration verification passed");
        true
    }

    /// Logical decoding must be enabled on the target before reverse replication
    async fn verify_reverse(&self) -> bool {
        match self.resources.target_admin.show_setting("wal_level").await {
            Ok(level) if level == "logical" => true,
            Ok(level) => {
                error!(wal_level = %level, "❌ Reverse migration requires wal_level=logical on the target");
                false
            }
            Err(e) => {
                error!(error = %e, "❌ Failed to read wal_level from the target");
                false
            }
        }
    }

    /// Turn target durability off for the job when configured to
    pub async fn before_task(&self) -> PortalResult<()> {
        if !self.ctx.factory.config().migration.adjust_kernel_param {
            return Ok(());
        }
        self.resources.target_admin.set_fsync(false).await?;
        self.kernel_adjusted.store(true, Ordering::Release);
        info!(task_id = %self.task_id(), "Turned fsync off on the target for the migration");
        Ok(())
    }

    /// Run the start pipeline of every enabled phase.
    ///
    /// Incremental replication keeps running when this returns; the
    /// operator ends it with a phase command or a task stop.
    pub async fn start_task(self: &Arc<Self>) -> PortalResult<ExecutionOutcome> {
        let mut executor = TaskExecutor::new(self.ctx.stop.clone());
        let migrate_objects = self.ctx.factory.config().migration.migrate_objects;

        if let Some(full) = &self.tasks.full {
            let (job, full) = (Arc::clone(self), Arc::clone(full));
            executor.add_step("full migration tables", move || async move {
                job.set_status(MigrationStatus::FullMigrationStarting);
                full.before_task().await?;
                job.set_status(MigrationStatus::FullMigrationRunning);
                full.migrate_table().await
            });
        }

        if let Some(incremental) = &self.tasks.incremental {
            let incremental = Arc::clone(incremental);
            executor.add_step("incremental source", move || async move {
                incremental.before_task().await?;
                incremental.start_source().await
            });
        }

        if let Some(full) = &self.tasks.full {
            let (job, full) = (Arc::clone(self), Arc::clone(full));
            let defer_foreign_keys = self.tasks.incremental.is_some();
            executor.add_step("full migration objects", move || async move {
                if migrate_objects {
                    full.migrate_objects().await?;
                } else {
                    full.wait_table_migration_exit().await?;
                }
                if !defer_foreign_keys {
                    full.migrate_foreign_keys().await?;
                }
                job.set_status(MigrationStatus::FullMigrationFinished);
                Ok(())
            });
        }

        if let Some(check) = &self.tasks.full_check {
            let (job, check) = (Arc::clone(self), Arc::clone(check));
            executor.add_step("full data check", move || async move {
                job.set_status(MigrationStatus::FullDataCheckStarting);
                check.before_task().await?;
                job.set_status(MigrationStatus::FullDataCheckRunning);
                check.start().await?;
                job.set_status(MigrationStatus::FullDataCheckFinished);
                Ok(())
            });
        }

        if let Some(incremental) = &self.tasks.incremental {
            let (job, incremental) = (Arc::clone(self), Arc::clone(incremental));
            let check = self.tasks.incremental_check.clone();
            executor.add_step("incremental migration", move || async move {
                job.set_status(MigrationStatus::IncrementalStarting);
                incremental.start_source().await?;
                incremental.start_sink().await?;
                if let Some(check) = check {
                    check.before_task().await?;
                    check.start().await?;
                }
                job.set_status(MigrationStatus::IncrementalRunning);
                Ok(())
            });
        }

        let reverse_only = self.tasks.full.is_none()
            && self.tasks.full_check.is_none()
            && self.tasks.incremental.is_none();
        if let (true, Some(reverse)) = (reverse_only, &self.tasks.reverse) {
            let (job, reverse) = (Arc::clone(self), Arc::clone(reverse));
            executor.add_step("reverse migration", move || async move {
                reverse.before_task().await?;
                job.before_reverse_done.store(true, Ordering::Release);
                job.execute_reverse(&reverse).await
            });
        }

        info!(task_id = %self.task_id(), steps = executor.len(), "🚀 Starting migration task");
        executor.execute().await
    }

    async fn execute_reverse(&self, reverse: &StreamTask) -> PortalResult<()> {
        self.set_status(MigrationStatus::ReverseStarting);
        reverse.start_source().await?;
        reverse.start_sink().await?;
        self.set_status(MigrationStatus::ReverseRunning);
        Ok(())
    }

    /// Release reverse preparation so a restarted incremental stream starts clean
    async fn clear_before_reverse(&self) {
        if !self.before_reverse_done.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(reverse) = &self.tasks.reverse {
            reverse.after_task().await;
        }
    }

    async fn migrate_deferred_foreign_keys(&self) {
        let Some(full) = &self.tasks.full else {
            return;
        };
        if full.is_foreign_key_migrated() {
            return;
        }
        info!(task_id = %self.task_id(), "Migrating deferred foreign keys");
        if let Err(e) = full.migrate_foreign_keys().await {
            error!(error = %e, "❌ Failed to migrate foreign keys");
        }
    }

    /// Stop every phase and release all external state. Later calls are no-ops.
    pub async fn stop_task(&self) {
        let _guard = self.operations.lock().await;
        if self.task_stopped.swap(true, Ordering::AcqRel) {
            info!(task_id = %self.task_id(), "Migration task already stopped");
            return;
        }

        if let Some(full) = &self.tasks.full {
            full.stop().await;
        }
        if let Some(check) = &self.tasks.full_check {
            check.stop().await;
        }
        if let Some(incremental) = &self.tasks.incremental {
            if let Some(check) = &self.tasks.incremental_check {
                check.stop().await;
            }
            incremental.stop().await;
            self.migrate_deferred_foreign_keys().await;
        }
        if let Some(reverse) = &self.tasks.reverse {
            reverse.stop().await;
        }

        self.after_task().await;
        info!(task_id = %self.task_id(), "🛑 Migration task stopped");
    }

    async fn after_task(&self) {
        if self.kernel_adjusted.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.resources.target_admin.set_fsync(true).await {
                log_cleanup_failure("migration job", "restore fsync, please set it on manually", &e);
            }
        }

        if let Some(full) = &self.tasks.full {
            full.after_task().await;
        }
        if let Some(check) = &self.tasks.full_check {
            check.after_task().await;
        }
        if let Some(incremental) = &self.tasks.incremental {
            incremental.after_task().await;
            if let Some(check) = &self.tasks.incremental_check {
                check.after_task().await;
            }
        }
        self.clear_before_reverse().await;
    }
}
