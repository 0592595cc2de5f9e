//! Change-stream replication through a source/sink connector pair.
//!
//! The same task drives forward incremental replication and reverse
//! replication. Reverse replication additionally owns the logical
//! replication objects on the database it reads from.

use super::{clear_history, PhaseTask, TaskContext};
use crate::constants::replication;
use crate::error::PortalResult;
use crate::logging::log_cleanup_failure;
use crate::process::{StreamDirection, StreamSide, Supervised, TaskProcess};
use crate::tools::{clean_task_topics, ensure_healthy, DatabaseAdmin, ReplicaIdentity};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Replica identity, logical slot and publication backing one stream.
///
/// `prepare` creates them in that order; `release` removes them in the
/// inverse order and only logs failures.
#[derive(Debug)]
pub struct ReplicationObjects {
    admin: Arc<dyn DatabaseAdmin>,
    schemas: Vec<String>,
    slot_base: String,
    /// Connector property file that receives the chosen slot name
    connector_properties: Option<PathBuf>,
    creates: bool,
    slot: Mutex<Option<String>>,
}

impl ReplicationObjects {
    /// Objects this task creates before streaming and drops afterwards
    pub fn managed(
        admin: Arc<dyn DatabaseAdmin>,
        schemas: Vec<String>,
        slot_base: impl Into<String>,
        connector_properties: PathBuf,
    ) -> Self {
        Self {
            admin,
            schemas,
            slot_base: slot_base.into(),
            connector_properties: Some(connector_properties),
            creates: true,
            slot: Mutex::new(None),
        }
    }

    /// Objects a connector creates on its own; only released here
    pub fn release_only(admin: Arc<dyn DatabaseAdmin>, slot: impl Into<String>) -> Self {
        let slot = slot.into();
        Self {
            admin,
            schemas: Vec::new(),
            slot_base: slot.clone(),
            connector_properties: None,
            creates: false,
            slot: Mutex::new(Some(slot)),
        }
    }

    pub fn slot_name(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    pub async fn prepare(&self) -> PortalResult<()> {
        if !self.creates {
            return Ok(());
        }
        self.apply_replica_identity(ReplicaIdentity::Full).await;
        self.create_slot().await?;
        self.create_publication().await
    }

    pub async fn release(&self) {
        self.drop_publication().await;
        self.drop_slot().await;
        if self.creates {
            self.apply_replica_identity(ReplicaIdentity::Default).await;
        }
    }

    async fn apply_replica_identity(&self, identity: ReplicaIdentity) {
        for schema in &self.schemas {
            let tables = match self.admin.list_tables(schema).await {
                Ok(tables) => tables,
                Err(e) => {
                    log_cleanup_failure("replication", &format!("list tables of {schema}"), &e);
                    continue;
                }
            };
            for table in tables {
                if let Err(e) = self.admin.set_replica_identity(schema, &table, identity).await {
                    warn!(
                        schema = %schema,
                        table = %table,
                        identity = ?identity,
                        error = %e,
                        "Failed to alter table replica identity"
                    );
                }
            }
        }
    }

    async fn create_slot(&self) -> PortalResult<()> {
        let existing = self.admin.list_replication_slots().await?;
        let mut name = self.slot_base.clone();
        while existing.contains(&name) {
            tokio::time::sleep(Duration::from_millis(10)).await;
            name = format!("{}_{}", self.slot_base, chrono::Utc::now().timestamp_millis());
        }

        self.admin
            .create_replication_slot(&name, replication::SLOT_PLUGIN)
            .await?;
        info!(slot = %name, "🔌 Created logical replication slot");
        *self.slot.lock() = Some(name.clone());

        if let Some(path) = &self.connector_properties {
            set_property(path, "slot.name", &name)?;
        }
        Ok(())
    }

    async fn create_publication(&self) -> PortalResult<()> {
        let name = replication::PUBLICATION_NAME;
        if self.admin.list_publications().await?.iter().any(|p| p == name) {
            debug!(publication = %name, "Dropping stale publication");
            self.admin.drop_publication(name).await?;
        }

        if self.admin.is_superuser().await? {
            self.admin.create_publication(name, None).await?;
        } else {
            let mut tables = Vec::new();
            for schema in &self.schemas {
                tables.extend(
                    self.admin
                        .list_tables(schema)
                        .await?
                        .into_iter()
                        .map(|table| format!("{schema}.{table}")),
                );
            }
            self.admin.create_publication(name, Some(&tables)).await?;
        }
        info!(publication = %name, "Created publication");
        Ok(())
    }

    async fn drop_publication(&self) {
        let name = replication::PUBLICATION_NAME;
        match self.admin.list_publications().await {
            Ok(publications) if publications.iter().any(|p| p == name) => {
                if let Err(e) = self.admin.drop_publication(name).await {
                    log_cleanup_failure("replication", "drop publication", &e);
                }
            }
            Ok(_) => {}
            Err(e) => log_cleanup_failure("replication", "list publications", &e),
        }
    }

    async fn drop_slot(&self) {
        let Some(slot) = self.slot_name() else {
            return;
        };
        match self.admin.list_replication_slots().await {
            Ok(slots) if slots.contains(&slot) => match self.admin.drop_replication_slot(&slot).await {
                Ok(()) => info!(slot = %slot, "Dropped logical replication slot"),
                Err(e) => log_cleanup_failure("replication", &format!("drop slot {slot}"), &e),
            },
            Ok(_) => {}
            Err(e) => log_cleanup_failure("replication", "list replication slots", &e),
        }
    }
}

/// Set `key=value` in a properties file, replacing an existing entry
fn set_property(path: &Path, key: &str, value: &str) -> PortalResult<()> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let prefix = format!("{key}=");
    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            if line.starts_with(&prefix) {
                replaced = true;
                format!("{prefix}{value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("{prefix}{value}"));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, lines.join("\n") + "\n")?;
    Ok(())
}

#[derive(Debug)]
pub struct StreamTask {
    ctx: TaskContext,
    direction: StreamDirection,
    source: Mutex<Option<Arc<TaskProcess>>>,
    sink: Mutex<Option<Arc<TaskProcess>>>,
    replication: Option<ReplicationObjects>,
}

impl StreamTask {
    pub fn new(ctx: TaskContext, direction: StreamDirection) -> Self {
        Self {
            ctx,
            direction,
            source: Mutex::new(None),
            sink: Mutex::new(None),
            replication: None,
        }
    }

    pub fn with_replication(mut self, replication: ReplicationObjects) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn replication(&self) -> Option<&ReplicationObjects> {
        self.replication.as_ref()
    }

    fn slot(&self, side: StreamSide) -> &Mutex<Option<Arc<TaskProcess>>> {
        match side {
            StreamSide::Source => &self.source,
            StreamSide::Sink => &self.sink,
        }
    }

    pub fn process(&self, side: StreamSide) -> Option<Arc<TaskProcess>> {
        self.slot(side).lock().clone()
    }

    fn server_name(&self) -> String {
        self.direction.topic_prefix(self.ctx.workspace().id())
    }

    pub async fn start_source(&self) -> PortalResult<()> {
        self.start_side(StreamSide::Source).await
    }

    pub async fn start_sink(&self) -> PortalResult<()> {
        self.start_side(StreamSide::Sink).await
    }

    async fn start_side(&self, side: StreamSide) -> PortalResult<()> {
        if let Some(current) = self.process(side) {
            if !current.is_stopped() && current.is_alive().await {
                debug!(process = %current.name(), "Connector already running");
                return Ok(());
            }
        }

        let process = Arc::new(self.ctx.factory.stream_connector(self.direction, side));
        if process.is_alive().await {
            warn!(process = %process.name(), "A connector with the same configuration is already running");
            return Ok(());
        }
        if self.ctx.stop.is_stopped() {
            debug!(process = %process.name(), "Task stopping, not starting connector");
            return Ok(());
        }

        if side == StreamSide::Source {
            if let Err(e) = self.ctx.bus.reset_schema_compatibility().await {
                warn!(error = %e, "Failed to reset schema compatibility");
            }
        }

        process.start().await?;
        *self.slot(side).lock() = Some(Arc::clone(&process));
        self.ctx.monitor.register(process);
        Ok(())
    }

    fn needs_restart(process: Option<Arc<TaskProcess>>) -> bool {
        process.map_or(true, |p| p.is_stopped() || !p.is_normal())
    }

    /// Relaunch whichever side is no longer running, sink first
    pub async fn resume_task(&self) -> PortalResult<()> {
        if Self::needs_restart(self.process(StreamSide::Sink)) {
            self.start_sink().await?;
        }
        if Self::needs_restart(self.process(StreamSide::Source)) {
            self.start_source().await?;
        }
        Ok(())
    }

    async fn kill_leftovers(&self) {
        let table = self.ctx.factory.table();
        for side in [StreamSide::Source, StreamSide::Sink] {
            let process = self.ctx.factory.stream_connector(self.direction, side);
            if let Err(e) = table.kill_matching(process.check_snippet(), true).await {
                warn!(process = %process.name(), error = %e, "Failed to kill leftover connector");
            }
        }
    }
}

#[async_trait]
impl PhaseTask for StreamTask {
    fn name(&self) -> &str {
        self.direction.direction_name()
    }

    async fn before_task(&self) -> PortalResult<()> {
        let workspace = self.ctx.workspace();
        let area = self.direction.area();
        clear_history(self.name(), &workspace.status_dir(area));
        clear_history(self.name(), &workspace.logs_dir(area));

        ensure_healthy(self.ctx.bus.as_ref(), &self.ctx.stop).await?;

        if let Some(replication) = &self.replication {
            if let Err(e) = replication.prepare().await {
                error!(stream = %self.name(), error = %e, "❌ Failed to prepare replication, releasing");
                replication.release().await;
                return Err(e);
            }
        }

        clean_task_topics(self.ctx.bus.as_ref(), &self.server_name()).await;
        self.kill_leftovers().await;
        Ok(())
    }

    async fn start(&self) -> PortalResult<()> {
        self.start_source().await?;
        self.start_sink().await
    }

    async fn stop(&self) {
        for side in [StreamSide::Source, StreamSide::Sink] {
            if let Some(process) = self.process(side) {
                process.stop().await;
            }
        }
    }

    async fn after_task(&self) {
        clean_task_topics(self.ctx.bus.as_ref(), &self.server_name()).await;
        if let Some(replication) = &self.replication {
            replication.release().await;
        }
    }
}
