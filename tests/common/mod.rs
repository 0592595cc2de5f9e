//! Shared harness for the integration suites: a [`MigrationManager`] wired
//! to in-memory fakes inside a temporary workspace.

#![allow(dead_code)]

use migration_portal::config::{ModeManager, PortalConfig};
use migration_portal::constants::{replica_orders, sentinels};
use migration_portal::manager::{ManagerServices, MigrationManager};
use migration_portal::process::{StreamDirection, StreamSide};
use migration_portal::test_helpers::{FakeBus, FakeDatabaseAdmin, FakeProcessTable};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const REPLICA_ORDERS: [&str; 9] = [
    replica_orders::DROP_REPLICA_SCHEMA,
    replica_orders::CREATE_REPLICA_SCHEMA,
    replica_orders::ADD_SOURCE,
    replica_orders::INIT_REPLICA,
    replica_orders::START_TRIGGER_REPLICA,
    replica_orders::START_VIEW_REPLICA,
    replica_orders::START_FUNC_REPLICA,
    replica_orders::START_PROC_REPLICA,
    replica_orders::DETACH_REPLICA,
];

pub struct PortalHarness {
    pub root: TempDir,
    pub table: Arc<FakeProcessTable>,
    pub bus: Arc<FakeBus>,
    pub target: Arc<FakeDatabaseAdmin>,
    pub manager: Arc<MigrationManager>,
}

/// Builder for [`PortalHarness`]
pub struct PortalHarnessBuilder {
    task_id: String,
    mode: String,
    custom_phases: Option<Vec<String>>,
    adjust_kernel_param: bool,
}

impl PortalHarnessBuilder {
    pub fn new(mode: &str) -> Self {
        Self {
            task_id: "21".to_string(),
            mode: mode.to_string(),
            custom_phases: None,
            adjust_kernel_param: false,
        }
    }

    /// Register `mode` as a custom mode made of `phases` before building
    pub fn with_custom_phases(mut self, phases: &[&str]) -> Self {
        self.custom_phases = Some(phases.iter().map(ToString::to_string).collect());
        self
    }

    pub fn with_task_id(mut self, task_id: &str) -> Self {
        self.task_id = task_id.to_string();
        self
    }

    pub fn with_kernel_adjustment(mut self) -> Self {
        self.adjust_kernel_param = true;
        self
    }

    pub fn build(self) -> PortalHarness {
        let root = TempDir::new().unwrap();
        let mut config = PortalConfig::default();
        config.migration.task_id = self.task_id;
        config.migration.mode = self.mode.clone();
        config.migration.adjust_kernel_param = self.adjust_kernel_param;
        config.workspace.root = root.path().to_path_buf();
        config.workspace.data_dir = root.path().join("data");
        config.target_database.schemas = vec!["shop".to_string()];

        if let Some(phases) = self.custom_phases {
            let definition = root.path().join(format!("{}.yml", self.mode));
            fs::write(
                &definition,
                format!("name: {}\nphases: [{}]\n", self.mode, phases.join(", ")),
            )
            .unwrap();
            ModeManager::new(&config.workspace.data_dir).add(&definition).unwrap();
        }

        let table = Arc::new(FakeProcessTable::new());
        for order in REPLICA_ORDERS {
            table.finish_on_spawn(&format!(" {order} "), &sentinels::replica_order(order));
        }
        let bus = Arc::new(FakeBus::new());
        let target = Arc::new(FakeDatabaseAdmin::new().with_tables("shop", &["orders", "items"]));

        let manager = MigrationManager::with_services(
            Arc::new(config),
            ManagerServices {
                table: table.clone(),
                bus: bus.clone(),
                target_admin: target.clone(),
                source_admin: None,
            },
        )
        .unwrap();

        PortalHarness {
            root,
            table,
            bus,
            target,
            manager,
        }
    }
}

impl PortalHarness {
    /// Command-line snippet identifying one stream connector process
    pub fn connector_snippet(&self, direction: StreamDirection, side: StreamSide) -> String {
        let (_, connector) = self
            .manager
            .job()
            .context()
            .factory
            .connector_config_files(direction, side);
        connector.display().to_string()
    }
}

/// Let background monitors run a few ticks under paused time
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}
