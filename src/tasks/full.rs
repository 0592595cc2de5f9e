//! Full migration phase.
//!
//! Ordered-command engines copy tables first, then dependent objects, and
//! foreign keys last. Foreign keys are migrated at most once per task: the
//! job calls [`FullMigrationTask::migrate_foreign_keys`] from several paths
//! and only the first call runs the engine.

use super::collection::CollectionTask;
use super::{clear_history, PhaseTask, TaskContext};
use crate::constants::{replica_orders, replicate_orders};
use crate::error::{PortalError, PortalResult};
use crate::logging::log_cleanup_failure;
use crate::process::adapters::FullCopyTool;
use crate::process::{Supervised, TaskProcess};
use crate::workspace::PhaseArea;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sub-command sequence of one full copy engine
#[derive(Debug)]
struct Orders {
    /// Run and checked before the table copy
    prepare: &'static [&'static str],
    table: &'static str,
    /// Run and checked right after the table copy exits
    after_table: &'static [&'static str],
    objects: &'static [&'static str],
    foreign_keys: &'static str,
    drop_schema: &'static str,
}

const REPLICA_ORDERS: Orders = Orders {
    prepare: &[
        replica_orders::DROP_REPLICA_SCHEMA,
        replica_orders::CREATE_REPLICA_SCHEMA,
        replica_orders::ADD_SOURCE,
    ],
    table: replica_orders::INIT_REPLICA,
    after_table: &[],
    objects: &[
        replica_orders::START_TRIGGER_REPLICA,
        replica_orders::START_VIEW_REPLICA,
        replica_orders::START_FUNC_REPLICA,
        replica_orders::START_PROC_REPLICA,
    ],
    foreign_keys: replica_orders::DETACH_REPLICA,
    drop_schema: replica_orders::DROP_REPLICA_SCHEMA,
};

const REPLICATE_ORDERS: Orders = Orders {
    prepare: &[],
    table: replicate_orders::TABLE,
    after_table: &[
        replicate_orders::SEQUENCE,
        replicate_orders::PRIMARY_KEY,
        replicate_orders::INDEX,
        replicate_orders::CONSTRAINT,
    ],
    objects: &[
        replicate_orders::VIEW,
        replicate_orders::FUNCTION,
        replicate_orders::TRIGGER,
        replicate_orders::PROCEDURE,
    ],
    foreign_keys: replicate_orders::FOREIGN_KEY,
    drop_schema: replicate_orders::DROP_REPLICA_SCHEMA,
};

/// Full copy driven through one engine's ordered sub-commands
#[derive(Debug)]
pub struct FullCopyTask {
    ctx: TaskContext,
    tool: FullCopyTool,
    current: Mutex<Option<Arc<TaskProcess>>>,
    table: Mutex<Option<Arc<TaskProcess>>>,
    table_migrated: AtomicBool,
    objects_migrated: AtomicBool,
    foreign_keys_migrated: AtomicBool,
}

impl FullCopyTask {
    pub fn new(ctx: TaskContext, tool: FullCopyTool) -> Self {
        Self {
            ctx,
            tool,
            current: Mutex::new(None),
            table: Mutex::new(None),
            table_migrated: AtomicBool::new(false),
            objects_migrated: AtomicBool::new(false),
            foreign_keys_migrated: AtomicBool::new(false),
        }
    }

    pub fn tool(&self) -> FullCopyTool {
        self.tool
    }

    fn orders(&self) -> &'static Orders {
        match self.tool {
            FullCopyTool::Replica => &REPLICA_ORDERS,
            FullCopyTool::Replicate => &REPLICATE_ORDERS,
        }
    }

    fn process(&self, order: &str) -> TaskProcess {
        let factory = &self.ctx.factory;
        match self.tool {
            FullCopyTool::Replica => factory.full_copy(order),
            FullCopyTool::Replicate => factory.full_replicate(order),
        }
    }

    /// An order of the start pipeline; waiting for it ends once the task stops
    fn pipeline_process(&self, order: &str) -> TaskProcess {
        self.process(order).with_stop_indicator(self.ctx.stop.clone())
    }

    /// Launch `process` as the current process and wait for it to exit
    async fn launch_and_wait(&self, process: TaskProcess) -> PortalResult<Arc<TaskProcess>> {
        let process = Arc::new(process);
        *self.current.lock() = Some(Arc::clone(&process));
        process.start().await?;
        process.wait_exit().await?;
        Ok(process)
    }

    /// Run one order to completion unless the task is stopping
    async fn run_order(&self, order: &str) -> PortalResult<()> {
        if self.ctx.stop.is_stopped() {
            debug!(order = %order, "Task stopping, skipping full copy order");
            return Ok(());
        }

        let process = self.launch_and_wait(self.pipeline_process(order)).await?;
        if !process.check_status().await {
            return Err(PortalError::ProcessAbnormalExit {
                name: process.name().to_string(),
            });
        }
        Ok(())
    }

    fn clean_history(&self) {
        let workspace = self.ctx.workspace();
        let log = workspace.full_migration_log();
        if let Err(e) = fs::remove_file(&log) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %log.display(), error = %e, "Failed to remove full migration log");
            }
        }
        clear_history("full migration", &workspace.status_dir(PhaseArea::Full));
        if let Err(e) = fs::create_dir_all(workspace.full_engine_status_dir()) {
            warn!(error = %e, "Failed to create full copy status directory");
        }
    }

    pub async fn before_task(&self) -> PortalResult<()> {
        match self.tool {
            FullCopyTool::Replica => {
                self.clean_history();
                for order in self.orders().prepare {
                    self.run_order(order).await?;
                }
            }
            FullCopyTool::Replicate => {
                // Leftover replica schema from an earlier run; its outcome does not matter
                self.launch_and_wait(self.process(self.orders().drop_schema)).await?;
                self.clean_history();
            }
        }
        Ok(())
    }

    /// Launch the table copy without waiting for it
    pub async fn migrate_table(&self) -> PortalResult<()> {
        let process = Arc::new(self.pipeline_process(self.orders().table));
        *self.current.lock() = Some(Arc::clone(&process));
        *self.table.lock() = Some(Arc::clone(&process));
        info!(tool = ?self.tool, "📦 Starting table migration");
        process.start().await
    }

    /// Wait for the table copy launched by [`Self::migrate_table`] and run
    /// the orders that depend on it. A no-op when no table copy is pending.
    pub async fn wait_table_migration_exit(&self) -> PortalResult<()> {
        let Some(process) = self.table.lock().take() else {
            return Ok(());
        };

        process.wait_exit().await?;
        if !process.check_status().await {
            return Err(PortalError::ProcessAbnormalExit {
                name: process.name().to_string(),
            });
        }
        if self.ctx.stop.is_stopped() {
            return Ok(());
        }

        for order in self.orders().after_table {
            self.run_order(order).await?;
        }
        self.table_migrated.store(true, Ordering::Release);
        info!("✅ Table migration finished");
        Ok(())
    }

    pub async fn migrate_objects(&self) -> PortalResult<()> {
        self.wait_table_migration_exit().await?;
        for order in self.orders().objects {
            self.run_order(order).await?;
        }
        if !self.ctx.stop.is_stopped() {
            self.objects_migrated.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Migrate foreign keys; only the first call runs the engine
    pub async fn migrate_foreign_keys(&self) -> PortalResult<()> {
        if self.foreign_keys_migrated.swap(true, Ordering::AcqRel) {
            debug!("Foreign keys already migrated");
            return Ok(());
        }

        info!(tool = ?self.tool, "🔗 Migrating foreign keys");
        let process = self
            .launch_and_wait(self.process(self.orders().foreign_keys))
            .await?;
        if !process.check_status().await {
            return Err(PortalError::ProcessAbnormalExit {
                name: process.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn is_table_migrated(&self) -> bool {
        self.table_migrated.load(Ordering::Acquire)
    }

    pub fn is_objects_migrated(&self) -> bool {
        self.objects_migrated.load(Ordering::Acquire)
    }

    pub fn is_foreign_key_migrated(&self) -> bool {
        self.foreign_keys_migrated.load(Ordering::Acquire)
    }

    pub async fn stop(&self) {
        let current = self.current.lock().clone();
        let table = self.table.lock().clone();
        for process in current.into_iter().chain(table) {
            process.stop().await;
        }
    }

    pub async fn after_task(&self) {
        match self.launch_and_wait(self.process(self.orders().drop_schema)).await {
            Ok(process) => {
                if !process.check_status().await {
                    log_cleanup_failure("full migration", "drop replica schema", &"engine exited abnormally");
                }
            }
            Err(e) => log_cleanup_failure("full migration", "drop replica schema", &e),
        }

        if self.tool == FullCopyTool::Replica {
            if let Err(e) = fs::remove_dir_all(self.ctx.workspace().full_engine_status_dir()) {
                if e.kind() != io::ErrorKind::NotFound {
                    log_cleanup_failure("full migration", "remove engine snapshots", &e);
                }
            }
        }
    }
}

/// Full migration of one job, by source kind
#[derive(Debug)]
pub enum FullMigrationTask {
    /// Relational sources copied by an ordered-command engine
    Copy(FullCopyTask),
    /// Vector sources copied one collection at a time
    Collections(CollectionTask),
}

impl FullMigrationTask {
    pub async fn before_task(&self) -> PortalResult<()> {
        match self {
            Self::Copy(task) => task.before_task().await,
            Self::Collections(task) => task.before_task().await,
        }
    }

    /// Start the table copy. Collection copies run to completion here.
    pub async fn migrate_table(&self) -> PortalResult<()> {
        match self {
            Self::Copy(task) => task.migrate_table().await,
            Self::Collections(task) => task.migrate_all().await,
        }
    }

    pub async fn wait_table_migration_exit(&self) -> PortalResult<()> {
        match self {
            Self::Copy(task) => task.wait_table_migration_exit().await,
            Self::Collections(_) => Ok(()),
        }
    }

    pub async fn migrate_objects(&self) -> PortalResult<()> {
        match self {
            Self::Copy(task) => task.migrate_objects().await,
            Self::Collections(_) => Ok(()),
        }
    }

    pub async fn migrate_foreign_keys(&self) -> PortalResult<()> {
        match self {
            Self::Copy(task) => task.migrate_foreign_keys().await,
            Self::Collections(_) => Ok(()),
        }
    }

    pub fn is_foreign_key_migrated(&self) -> bool {
        match self {
            Self::Copy(task) => task.is_foreign_key_migrated(),
            Self::Collections(_) => true,
        }
    }

    pub async fn stop(&self) {
        match self {
            Self::Copy(task) => task.stop().await,
            Self::Collections(task) => task.stop().await,
        }
    }

    pub async fn after_task(&self) {
        match self {
            Self::Copy(task) => task.after_task().await,
            Self::Collections(task) => task.after_task().await,
        }
    }
}

#[async_trait]
impl PhaseTask for FullMigrationTask {
    fn name(&self) -> &str {
        "full migration"
    }

    async fn before_task(&self) -> PortalResult<()> {
        FullMigrationTask::before_task(self).await
    }

    async fn start(&self) -> PortalResult<()> {
        self.migrate_table().await
    }

    async fn stop(&self) {
        FullMigrationTask::stop(self).await
    }

    async fn after_task(&self) {
        FullMigrationTask::after_task(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::test_helpers::TaskFixture;
    use std::time::Duration;
    use tempfile::TempDir;

    fn replica_fixture(root: &TempDir) -> TaskFixture {
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        fx.finish_replica_orders(&[
            replica_orders::DROP_REPLICA_SCHEMA,
            replica_orders::CREATE_REPLICA_SCHEMA,
            replica_orders::ADD_SOURCE,
            replica_orders::INIT_REPLICA,
            replica_orders::START_TRIGGER_REPLICA,
            replica_orders::START_VIEW_REPLICA,
            replica_orders::START_FUNC_REPLICA,
            replica_orders::START_PROC_REPLICA,
            replica_orders::DETACH_REPLICA,
        ]);
        fx
    }

    fn orders_run(fx: &TaskFixture) -> Vec<String> {
        fx.table
            .spawned_names()
            .into_iter()
            .map(|name| name.trim_start_matches("full migration ").to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_replica_full_sequence() {
        let root = TempDir::new().unwrap();
        let fx = replica_fixture(&root);
        let task = FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replica);

        task.before_task().await.unwrap();
        task.migrate_table().await.unwrap();
        task.migrate_objects().await.unwrap();
        task.migrate_foreign_keys().await.unwrap();

        assert_eq!(
            orders_run(&fx),
            vec![
                "drop_replica_schema",
                "create_replica_schema",
                "add_source",
                "init_replica",
                "start_trigger_replica",
                "start_view_replica",
                "start_func_replica",
                "start_proc_replica",
                "detach_replica",
            ]
        );
        assert!(task.is_table_migrated());
        assert!(task.is_objects_migrated());
        assert!(task.is_foreign_key_migrated());

        let detach = fx
            .table
            .spawned()
            .into_iter()
            .find(|(name, _)| name.ends_with("detach_replica"))
            .map(|(_, spec)| spec)
            .unwrap();
        assert_eq!(detach.stdin.as_deref(), Some("YES"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_keys_migrate_once() {
        let root = TempDir::new().unwrap();
        let fx = replica_fixture(&root);
        let task = FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replica);

        task.migrate_foreign_keys().await.unwrap();
        task.migrate_foreign_keys().await.unwrap();

        assert_eq!(fx.table.spawn_count(" detach_replica "), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_table_exit_fails() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        fx.table
            .finish_on_spawn(" init_replica ", "Traceback: connection refused");
        let task = FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replica);

        task.migrate_table().await.unwrap();
        let err = task.wait_table_migration_exit().await.unwrap_err();

        assert!(matches!(err, PortalError::ProcessAbnormalExit { .. }));
        assert!(!task.is_table_migrated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replicate_runs_table_dependents() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        fx.finish_replicate_orders(&[
            replicate_orders::TABLE,
            replicate_orders::SEQUENCE,
            replicate_orders::PRIMARY_KEY,
            replicate_orders::INDEX,
            replicate_orders::CONSTRAINT,
        ]);
        let task = FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replicate);

        task.migrate_table().await.unwrap();
        task.wait_table_migration_exit().await.unwrap();

        let names = fx.table.spawned_names();
        assert_eq!(
            names,
            vec![
                "full replicate table",
                "full replicate sequence",
                "full replicate primarykey",
                "full replicate index",
                "full replicate constraint",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_skips_remaining_orders() {
        let root = TempDir::new().unwrap();
        let fx = replica_fixture(&root);
        let task = FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replica);

        fx.ctx.stop.set();
        task.before_task().await.unwrap();
        task.migrate_objects().await.unwrap();

        assert!(fx.table.spawned_names().is_empty());
        assert!(!task.is_objects_migrated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_table_copy_wait() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        fx.finish_replica_orders(&[
            replica_orders::DROP_REPLICA_SCHEMA,
            replica_orders::CREATE_REPLICA_SCHEMA,
            replica_orders::ADD_SOURCE,
        ]);
        let task = Arc::new(FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replica));
        task.before_task().await.unwrap();
        task.migrate_table().await.unwrap();

        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.migrate_objects().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished());

        fx.ctx.stop.set();
        waiter.await.unwrap().unwrap();

        assert!(!task.is_table_migrated());
        assert!(!task.is_objects_migrated());
        assert_eq!(fx.table.spawn_count(" start_trigger_replica "), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_keys_wait_even_while_stopping() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        let task = Arc::new(FullCopyTask::new(fx.ctx.clone(), FullCopyTool::Replica));
        fx.ctx.stop.set();

        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.migrate_foreign_keys().await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!waiter.is_finished());
        assert_eq!(fx.table.spawn_count(" detach_replica "), 1);
        waiter.abort();
    }
}
