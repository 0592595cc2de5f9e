//! Wiring of one task's collaborators against the in-memory fakes.

use super::{FakeBus, FakeProcessTable};
use crate::config::PortalConfig;
use crate::constants::sentinels;
use crate::error::PortalResult;
use crate::executor::StopIndicator;
use crate::process::adapters::ProcessFactory;
use crate::process::{MonitorEvent, ProcessMonitor};
use crate::state_machine::StatusMonitor;
use crate::tasks::TaskContext;
use crate::workspace::TaskWorkspace;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct TaskFixture {
    pub config: Arc<PortalConfig>,
    pub workspace: TaskWorkspace,
    pub table: Arc<FakeProcessTable>,
    pub bus: Arc<FakeBus>,
    pub status: Arc<StatusMonitor>,
    pub monitor: Arc<ProcessMonitor>,
    pub events: mpsc::UnboundedReceiver<MonitorEvent>,
    pub ctx: TaskContext,
}

impl TaskFixture {
    /// Create a workspace under `root` and wire every fake into a [`TaskContext`]
    pub fn new(root: &Path, mut config: PortalConfig) -> PortalResult<Self> {
        if config.migration.task_id.is_empty() {
            config.migration.task_id = "1".to_string();
        }
        config.workspace.root = root.to_path_buf();
        let config = Arc::new(config);

        let workspace = TaskWorkspace::new(root, config.migration.task_id.clone());
        workspace.create()?;

        let table = Arc::new(FakeProcessTable::new());
        let bus = Arc::new(FakeBus::new());
        let status = Arc::new(StatusMonitor::load(workspace.migration_status_file())?);
        let stop = StopIndicator::new();
        let (monitor, events) = ProcessMonitor::new(
            Arc::clone(&status),
            bus.clone(),
            config.supervision.clone(),
            stop.clone(),
        );

        let ctx = TaskContext {
            factory: ProcessFactory::new(Arc::clone(&config), workspace.clone(), table.clone()),
            stop,
            bus: bus.clone(),
            monitor: Arc::clone(&monitor),
        };

        Ok(Self {
            config,
            workspace,
            table,
            bus,
            status,
            monitor,
            events,
            ctx,
        })
    }

    /// Let the named replica engine orders finish cleanly as soon as they launch
    pub fn finish_replica_orders(&self, orders: &[&str]) {
        for order in orders {
            self.table
                .finish_on_spawn(&format!(" {order} "), &sentinels::replica_order(order));
        }
    }

    /// Let the named replicate tool orders finish cleanly as soon as they launch
    pub fn finish_replicate_orders(&self, orders: &[&str]) {
        for order in orders {
            self.table
                .finish_on_spawn(&format!("--start {order} "), &sentinels::replicate_order(order));
        }
    }
}
