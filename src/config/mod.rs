//! # Portal Configuration System
//!
//! YAML-based configuration for one migration task: where the task workspace
//! lives, which source type and migration mode the job runs, where each
//! external engine is installed, and the supervision timings.
//!
//! ## Architecture
//!
//! - **Single file**: everything comes from `portal-config.yaml`
//! - **Environment Awareness**: `development`/`test`/`production` override sections
//! - **Explicit Validation**: loading fails fast on malformed or missing settings
//! - **Observed defaults**: stop window, bus restart attempts and back-off are
//!   configurable and default to 5 s, 3 attempts and 5 s
//!
//! ## Usage
//!
//! ```rust,no_run
//! use migration_portal::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let task_id = &manager.config().migration.task_id;
//! let stop_window = manager.config().supervision.stop_window();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;
pub mod mode;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;
pub use mode::{MigrationMode, ModeManager};

/// Root configuration structure mirroring portal-config.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Environment the configuration was loaded for
    pub environment: String,

    /// Workspace root and portal data directory
    pub workspace: WorkspaceConfig,

    /// Job definition: task id, source type, mode and feature switches
    pub migration: MigrationConfig,

    /// Process supervision timings
    pub supervision: SupervisionConfig,

    /// Progress monitor settings
    pub progress: ProgressConfig,

    /// Message bus used by the change-stream connectors
    pub bus: BusConfig,

    /// External engine installation paths
    pub tools: ToolsConfig,

    pub source_database: DatabaseConfig,

    pub target_database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding one `task_<id>` directory per task
    pub root: PathBuf,
    /// Directory holding portal-wide data such as custom migration modes
    pub data_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workspace"),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Kind of source database the job migrates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Mysql,
    Postgresql,
    Milvus,
}

impl SourceType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgresql => "postgresql",
            Self::Milvus => "milvus",
        }
    }
}

impl Default for SourceType {
    fn default() -> Self {
        Self::Mysql
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub task_id: String,
    pub source_type: SourceType,
    /// Name of a built-in or custom migration mode
    pub mode: String,
    /// Migrate views, triggers, functions and procedures after tables
    pub migrate_objects: bool,
    /// Turn `fsync` off on the target during the job and back on afterwards
    pub adjust_kernel_param: bool,
    /// Pass database passwords to engines through environment variables
    pub interactive_password: bool,
    /// Collections to migrate when the source is a vector database
    pub collections: Vec<String>,
    /// Concurrent collection migrations for vector sources
    pub collection_concurrency: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            source_type: SourceType::default(),
            mode: "plan1".to_string(),
            migrate_objects: true,
            adjust_kernel_param: false,
            interactive_password: false,
            collections: Vec::new(),
            collection_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Time a terminated process gets before it is force-killed
    pub stop_window_secs: u64,
    pub stop_poll_secs: u64,
    /// Poll interval while a step waits for an engine to exit
    pub wait_exit_poll_ms: u64,
    /// Process monitor tick
    pub monitor_interval_ms: u64,
    /// Monitor ticks without a stream status update before the stream counts as hung
    pub stale_status_ticks: u32,
}

impl SupervisionConfig {
    pub fn stop_window(&self) -> Duration {
        Duration::from_secs(self.stop_window_secs)
    }

    pub fn stop_poll(&self) -> Duration {
        Duration::from_secs(self.stop_poll_secs)
    }

    pub fn wait_exit_poll(&self) -> Duration {
        Duration::from_millis(self.wait_exit_poll_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            stop_window_secs: 5,
            stop_poll_secs: 1,
            wait_exit_poll_ms: 1000,
            monitor_interval_ms: 500,
            stale_status_ticks: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl ProgressConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            heartbeat_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Installation directory of the message bus distribution
    pub home: PathBuf,
    pub bootstrap_servers: String,
    pub zookeeper_port: u16,
    pub schema_registry_url: String,
    pub restart_attempts: u32,
    pub restart_backoff_secs: u64,
    /// Wait after launching each bus component
    pub start_wait_secs: u64,
}

impl BusConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    pub fn start_wait(&self) -> Duration {
        Duration::from_secs(self.start_wait_secs)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from("tools/confluent"),
            bootstrap_servers: "localhost:9092".to_string(),
            zookeeper_port: 2181,
            schema_registry_url: "http://localhost:8081".to_string(),
            restart_attempts: 3,
            restart_backoff_secs: 5,
            start_wait_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub python: String,
    pub java: String,
    pub jvm_options: String,
    /// Full-copy engine driven by ordered sub-commands
    pub full_copy_home: PathBuf,
    /// Jar of the full replicate tool for PostgreSQL sources
    pub full_replicate_jar: PathBuf,
    /// Directory with the data checker jars
    pub data_checker_home: PathBuf,
    /// Directory with the change-stream connector plugins
    pub connector_home: PathBuf,
    /// Vector collection migration command
    pub vector_tool_command: String,
    pub full_copy_start_wait_secs: u64,
    pub full_replicate_start_wait_secs: u64,
    pub data_checker_start_wait_secs: u64,
    pub connector_start_wait_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            java: "java".to_string(),
            jvm_options: "-Xms256M -Xmx2G".to_string(),
            full_copy_home: PathBuf::from("tools/chameleon"),
            full_replicate_jar: PathBuf::from("tools/full-replicate/full-replicate.jar"),
            data_checker_home: PathBuf::from("tools/datachecker"),
            connector_home: PathBuf::from("tools/debezium"),
            vector_tool_command: "vector-migrate".to_string(),
            full_copy_start_wait_secs: 2,
            full_replicate_start_wait_secs: 2,
            data_checker_start_wait_secs: 5,
            connector_start_wait_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schemas: Vec<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Build a PostgreSQL-protocol connection URL from the components
    pub fn connection_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            schemas: Vec::new(),
            max_connections: 2,
        }
    }
}

impl PortalConfig {
    /// Validate the configuration, failing on the first problem found
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let task_id = self.migration.task_id.trim();
        if task_id.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "migration.task_id",
                "migration configuration",
            ));
        }
        if !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigurationError::invalid_value(
                "migration.task_id",
                task_id,
                "only letters, numbers, underscores and hyphens are allowed",
            ));
        }

        if self.migration.mode.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "migration.mode",
                "migration configuration",
            ));
        }

        if self.migration.source_type == SourceType::Milvus {
            if self.migration.collections.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "migration.collections",
                    "vector source configuration",
                ));
            }
            if self.migration.collection_concurrency == 0 {
                return Err(ConfigurationError::invalid_value(
                    "migration.collection_concurrency",
                    "0",
                    "concurrency must be greater than 0",
                ));
            }
        }

        if self.bus.restart_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "bus.restart_attempts",
                "0",
                "at least one restart attempt is required",
            ));
        }

        if self.supervision.stop_poll_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "supervision.stop_poll_secs",
                "0",
                "poll interval must be greater than 0",
            ));
        }

        if self.supervision.wait_exit_poll_ms == 0 || self.supervision.monitor_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "supervision",
                "0",
                "poll intervals must be greater than 0",
            ));
        }

        if self.progress.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "progress.poll_interval_ms",
                "0",
                "poll interval must be greater than 0",
            ));
        }

        for (section, db) in [
            ("source_database", &self.source_database),
            ("target_database", &self.target_database),
        ] {
            if db.host.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    format!("{section}.host"),
                    "database configuration",
                ));
            }
            if db.max_connections == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("{section}.max_connections"),
                    "0",
                    "pool size must be greater than 0",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> PortalConfig {
        let mut config = PortalConfig::default();
        config.migration.task_id = "t1".to_string();
        config
    }

    #[test]
    fn test_defaults_match_observed_constants() {
        let config = PortalConfig::default();
        assert_eq!(config.supervision.stop_window(), Duration::from_secs(5));
        assert_eq!(config.supervision.stop_poll(), Duration::from_secs(1));
        assert_eq!(config.bus.restart_attempts, 3);
        assert_eq!(config.bus.restart_backoff(), Duration::from_secs(5));
        assert_eq!(config.progress.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.supervision.stale_status_ticks, 60);
    }

    #[test]
    fn test_validate_requires_task_id() {
        let config = PortalConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingRequiredField { .. })
        ));
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_task_id() {
        let mut config = valid_config();
        config.migration.task_id = "../escape".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_restart_attempts() {
        let mut config = valid_config();
        config.bus.restart_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vector_source_requires_collections() {
        let mut config = valid_config();
        config.migration.source_type = SourceType::Milvus;
        assert!(config.validate().is_err());
        config.migration.collections = vec!["docs".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_connection_url() {
        let db = DatabaseConfig {
            host: "db".to_string(),
            port: 5433,
            database: "app".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            ..DatabaseConfig::default()
        };
        assert_eq!(db.connection_url(), "postgresql://u:p@db:5433/app");
    }
}
