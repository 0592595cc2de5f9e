//! Recording database admin.
//!
//! Every call is appended to an operation log so tests can assert ordering
//! of preparation and cleanup steps.

use crate::error::{PortalError, PortalResult};
use crate::tools::database::{DatabaseAdmin, ReplicaIdentity};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct AdminState {
    tables: HashMap<String, Vec<String>>,
    identities: HashMap<String, ReplicaIdentity>,
    settings: HashMap<String, String>,
    slots: Vec<String>,
    publications: Vec<(String, Option<Vec<String>>)>,
    fsync: Vec<bool>,
    superuser: bool,
    failing: Vec<String>,
    operations: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeDatabaseAdmin {
    state: Mutex<AdminState>,
}

impl FakeDatabaseAdmin {
    pub fn new() -> Self {
        let admin = Self::default();
        admin.set_setting("wal_level", "logical");
        admin
    }

    pub fn with_tables(self, schema: &str, tables: &[&str]) -> Self {
        self.state.lock().tables.insert(
            schema.to_string(),
            tables.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn set_superuser(&self, superuser: bool) {
        self.state.lock().superuser = superuser;
    }

    pub fn set_setting(&self, name: &str, value: &str) {
        self.state
            .lock()
            .settings
            .insert(name.to_string(), value.to_string());
    }

    pub fn add_slot(&self, name: &str) {
        self.state.lock().slots.push(name.to_string());
    }

    /// Make the named trait operation fail, e.g. `"set_fsync"`
    pub fn fail_operation(&self, operation: &str) {
        self.state.lock().failing.push(operation.to_string());
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    pub fn slots(&self) -> Vec<String> {
        self.state.lock().slots.clone()
    }

    pub fn publications(&self) -> Vec<(String, Option<Vec<String>>)> {
        self.state.lock().publications.clone()
    }

    pub fn fsync_history(&self) -> Vec<bool> {
        self.state.lock().fsync.clone()
    }

    pub fn replica_identity(&self, schema: &str, table: &str) -> Option<ReplicaIdentity> {
        self.state
            .lock()
            .identities
            .get(&format!("{schema}.{table}"))
            .copied()
    }

    fn record(&self, operation: &str, detail: &str) -> PortalResult<()> {
        let mut state = self.state.lock();
        state.operations.push(if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{operation}:{detail}")
        });
        if state.failing.iter().any(|failing| failing == operation) {
            return Err(PortalError::Internal(format!("{operation} failed")));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdmin for FakeDatabaseAdmin {
    async fn ping(&self) -> PortalResult<()> {
        self.record("ping", "")
    }

    async fn show_setting(&self, name: &str) -> PortalResult<String> {
        self.record("show_setting", name)?;
        Ok(self
            .state
            .lock()
            .settings
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_fsync(&self, enabled: bool) -> PortalResult<()> {
        self.record("set_fsync", if enabled { "on" } else { "off" })?;
        self.state.lock().fsync.push(enabled);
        Ok(())
    }

    async fn list_tables(&self, schema: &str) -> PortalResult<Vec<String>> {
        self.record("list_tables", schema)?;
        Ok(self
            .state
            .lock()
            .tables
            .get(schema)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_replica_identity(
        &self,
        schema: &str,
        table: &str,
        identity: ReplicaIdentity,
    ) -> PortalResult<()> {
        self.record("set_replica_identity", &format!("{schema}.{table}={identity:?}"))?;
        self.state
            .lock()
            .identities
            .insert(format!("{schema}.{table}"), identity);
        Ok(())
    }

    async fn list_replication_slots(&self) -> PortalResult<Vec<String>> {
        self.record("list_replication_slots", "")?;
        Ok(self.slots())
    }

    async fn create_replication_slot(&self, name: &str, _plugin: &str) -> PortalResult<()> {
        self.record("create_replication_slot", name)?;
        self.state.lock().slots.push(name.to_string());
        Ok(())
    }

    async fn drop_replication_slot(&self, name: &str) -> PortalResult<()> {
        self.record("drop_replication_slot", name)?;
        self.state.lock().slots.retain(|slot| slot != name);
        Ok(())
    }

    async fn list_publications(&self) -> PortalResult<Vec<String>> {
        self.record("list_publications", "")?;
        Ok(self
            .state
            .lock()
            .publications
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_publication(&self, name: &str, tables: Option<&[String]>) -> PortalResult<()> {
        self.record("create_publication", name)?;
        self.state
            .lock()
            .publications
            .push((name.to_string(), tables.map(<[String]>::to_vec)));
        Ok(())
    }

    async fn drop_publication(&self, name: &str) -> PortalResult<()> {
        self.record("drop_publication", name)?;
        self.state
            .lock()
            .publications
            .retain(|(existing, _)| existing != name);
        Ok(())
    }

    async fn is_superuser(&self) -> PortalResult<bool> {
        self.record("is_superuser", "")?;
        Ok(self.state.lock().superuser)
    }
}
