//! Per-engine process construction.
//!
//! Adapters differ only in command line, working directory, log path, the
//! completion sentinel and whether a confirmation is piped on start. Check
//! snippets are unique configuration paths so a liveness probe matches the
//! engine no matter which launcher script started it.

use super::os::{LaunchSpec, ProcessTable};
use super::{ExitPolicy, ProcessKind, StatusArtifact, StreamDirection, StreamSide, TaskProcess};
use crate::config::{BusConfig, PortalConfig};
use crate::constants::{replica_orders, sentinels, status_prefixes};
use crate::workspace::{PhaseArea, TaskWorkspace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Full copy engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullCopyTool {
    /// Replica-style engine driven by ordered sub-commands (MySQL sources)
    Replica,
    /// Replicate jar (PostgreSQL sources)
    Replicate,
}

/// The three cooperating data checker processes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerRole {
    Source,
    Sink,
    Check,
}

impl CheckerRole {
    pub const ALL: [CheckerRole; 3] = [Self::Source, Self::Sink, Self::Check];

    pub fn role_name(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Sink => "sink",
            Self::Check => "check",
        }
    }

    fn stop_marker(&self) -> &'static str {
        match self {
            Self::Source => sentinels::CHECK_SOURCE_STOP,
            Self::Sink => sentinels::CHECK_SINK_STOP,
            Self::Check => sentinels::CHECK_CHECK_STOP,
        }
    }
}

impl StreamDirection {
    pub fn area(&self) -> PhaseArea {
        match self {
            Self::Incremental => PhaseArea::Incremental,
            Self::Reverse => PhaseArea::Reverse,
        }
    }

    pub fn direction_name(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Reverse => "reverse",
        }
    }

    /// Prefix of the status snapshots written by one side
    pub fn status_prefix(&self, side: StreamSide) -> &'static str {
        match (self, side) {
            (Self::Incremental, StreamSide::Source) => status_prefixes::FORWARD_SOURCE,
            (Self::Incremental, StreamSide::Sink) => status_prefixes::FORWARD_SINK,
            (Self::Reverse, StreamSide::Source) => status_prefixes::REVERSE_SOURCE,
            (Self::Reverse, StreamSide::Sink) => status_prefixes::REVERSE_SINK,
        }
    }

    /// Prefix shared by this task's message-bus topics
    pub fn topic_prefix(&self, task_id: &str) -> String {
        match self {
            Self::Incremental => format!("mysql_server_{task_id}"),
            Self::Reverse => format!("reverse_server_{task_id}"),
        }
    }
}

impl StreamSide {
    pub fn side_name(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Sink => "sink",
        }
    }
}

/// Builds supervised processes for one task
#[derive(Debug, Clone)]
pub struct ProcessFactory {
    config: Arc<PortalConfig>,
    workspace: TaskWorkspace,
    table: Arc<dyn ProcessTable>,
}

impl ProcessFactory {
    pub fn new(config: Arc<PortalConfig>, workspace: TaskWorkspace, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            config,
            workspace,
            table,
        }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    pub fn workspace(&self) -> &TaskWorkspace {
        &self.workspace
    }

    pub fn table(&self) -> Arc<dyn ProcessTable> {
        Arc::clone(&self.table)
    }

    fn process(
        &self,
        name: String,
        kind: ProcessKind,
        spec: LaunchSpec,
        snippet: String,
        policy: ExitPolicy,
    ) -> TaskProcess {
        TaskProcess::new(
            name,
            kind,
            spec,
            snippet,
            policy,
            Arc::clone(&self.table),
            self.config.supervision.clone(),
        )
    }

    /// Passwords handed to engines out-of-band when interactive entry is on
    fn password_env(&self) -> Vec<(String, String)> {
        if !self.config.migration.interactive_password {
            return Vec::new();
        }
        vec![
            ("ENABLE_ENV_PASSWORD".to_string(), "true".to_string()),
            (
                "SOURCE_DB_PASSWORD".to_string(),
                self.config.source_database.password.clone(),
            ),
            (
                "TARGET_DB_PASSWORD".to_string(),
                self.config.target_database.password.clone(),
            ),
        ]
    }

    /// One sub-command of the replica-style full copy engine
    pub fn full_copy(&self, order: &str) -> TaskProcess {
        let tools = &self.config.tools;
        let mut command = format!(
            "{} {order} --config default_{}",
            tools.full_copy_home.join("chameleon").display(),
            self.workspace.id()
        );
        if replica_orders::NEED_SOURCE.contains(&order) {
            command.push_str(" --source mysql");
        }

        let log = self.workspace.full_migration_log();
        let mut spec = LaunchSpec::new(command.clone(), self.workspace.full_engine_status_dir(), &log)
            .with_env(self.password_env())
            .with_startup_wait(Duration::from_secs(tools.full_copy_start_wait_secs));
        if order == replica_orders::DETACH_REPLICA {
            spec = spec.with_stdin(replica_orders::DETACH_CONFIRMATION);
        }

        self.process(
            format!("full migration {order}"),
            ProcessKind::FullMigration,
            spec,
            command,
            ExitPolicy::LogSentinel {
                log,
                sentinel: sentinels::replica_order(order),
            },
        )
    }

    /// One sub-command of the replicate jar
    pub fn full_replicate(&self, order: &str) -> TaskProcess {
        let tools = &self.config.tools;
        let config_file = self
            .workspace
            .config_dir(PhaseArea::Full)
            .join("full-replicate.yml");
        let snippet = format!(
            "-jar {} --start {order} --source postgresql --config {}",
            tools.full_replicate_jar.display(),
            config_file.display()
        );
        let command = format!("{} {} {snippet}", tools.java, tools.jvm_options);

        let log = self.workspace.full_migration_log();
        let spec = LaunchSpec::new(command, self.workspace.full_engine_status_dir(), &log)
            .with_env(self.password_env())
            .with_startup_wait(Duration::from_secs(tools.full_replicate_start_wait_secs));

        self.process(
            format!("full replicate {order}"),
            ProcessKind::FullMigration,
            spec,
            snippet,
            ExitPolicy::LogSentinel {
                log,
                sentinel: sentinels::replicate_order(order),
            },
        )
    }

    /// Worker and connector property files of one connector process
    pub fn connector_config_files(&self, direction: StreamDirection, side: StreamSide) -> (PathBuf, PathBuf) {
        let dir = self.workspace.config_dir(direction.area());
        let side = side.side_name();
        (
            dir.join(format!("{side}-worker.properties")),
            dir.join(format!("{side}-connector.properties")),
        )
    }

    /// One side of a change-stream connector pair
    pub fn stream_connector(&self, direction: StreamDirection, side: StreamSide) -> TaskProcess {
        let area = direction.area();
        let (worker, connector) = self.connector_config_files(direction, side);
        let snippet = format!("{} {}", worker.display(), connector.display());
        let command = format!(
            "{} {snippet}",
            self.config.bus.home.join("bin").join("connect-standalone").display()
        );
        let log4j = self
            .workspace
            .config_dir(area)
            .join(format!("{}-log4j.properties", side.side_name()));

        let spec = LaunchSpec::new(
            command,
            self.workspace.status_dir(area),
            self.workspace
                .logs_dir(area)
                .join(format!("connect-{}.log", side.side_name())),
        )
        .with_env(vec![(
            "KAFKA_LOG4J_OPTS".to_string(),
            format!("-Dlog4j.configuration=file:{}", log4j.display()),
        )])
        .with_startup_wait(Duration::from_secs(self.config.tools.connector_start_wait_secs));

        self.process(
            format!("{} {}", direction.direction_name(), side.side_name()),
            ProcessKind::Stream(direction, side),
            spec,
            snippet,
            ExitPolicy::Streaming,
        )
        .with_status_artifact(StatusArtifact {
            dir: self.workspace.status_dir(area),
            prefix: direction.status_prefix(side).to_string(),
        })
    }

    /// One data checker process; `area` selects the full or incremental check
    pub fn data_checker(&self, area: PhaseArea, role: CheckerRole) -> TaskProcess {
        let tools = &self.config.tools;
        let home = &tools.data_checker_home;
        let config_file = self
            .workspace
            .config_dir(area)
            .join(format!("application-{}.yml", role.role_name()));

        let jar_part = match role {
            CheckerRole::Source | CheckerRole::Sink => format!(
                "{} --{}",
                home.join("datachecker-extract.jar").display(),
                role.role_name()
            ),
            CheckerRole::Check => home.join("datachecker-check.jar").display().to_string(),
        };
        let snippet = format!(
            "-Dspring.config.additional-location={} -jar {jar_part}",
            config_file.display()
        );
        let command = format!(
            "{} {} -Dloader.path={} {snippet}",
            tools.java,
            tools.jvm_options,
            home.join("lib").display()
        );

        let incremental = area == PhaseArea::IncrementalDataCheck;
        let (kind, policy, label) = if incremental {
            (ProcessKind::IncrementalDataCheck, ExitPolicy::Background, "incremental")
        } else {
            (
                ProcessKind::FullDataCheck,
                ExitPolicy::SignFile {
                    path: self.workspace.check_sign_file(area),
                    marker: role.stop_marker().to_string(),
                },
                "full",
            )
        };

        let spec = LaunchSpec::new(
            command,
            self.workspace.status_dir(area),
            self.workspace
                .logs_dir(area)
                .join(format!("{}.log", role.role_name())),
        )
        .with_startup_wait(Duration::from_secs(tools.data_checker_start_wait_secs));

        self.process(
            format!("{label} data check {}", role.role_name()),
            kind,
            spec,
            snippet,
            policy,
        )
    }

    /// Migration of one vector collection into a table of the same name
    pub fn collection_copy(&self, collection: &str) -> TaskProcess {
        let command = format!(
            "{} {collection} {collection}",
            self.config.tools.vector_tool_command
        );
        let log = self.workspace.collection_log(collection);
        let spec = LaunchSpec::new(command.clone(), self.workspace.tmp_dir(), &log)
            .with_env(self.password_env())
            .with_startup_wait(Duration::from_millis(100));

        self.process(
            format!("collection migration {collection}"),
            ProcessKind::FullMigration,
            spec,
            command,
            ExitPolicy::LogSentinel {
                log,
                sentinel: sentinels::COLLECTION_END.to_string(),
            },
        )
    }
}

/// One long-running message-bus daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusComponent {
    pub name: String,
    pub spec: LaunchSpec,
    pub check_snippet: String,
}

/// Zookeeper, broker and schema registry, in start order
pub fn bus_components(bus: &BusConfig) -> Vec<BusComponent> {
    let component = |name: &str, script: &str, config: PathBuf| {
        let snippet = config.display().to_string();
        BusComponent {
            name: name.to_string(),
            spec: LaunchSpec::new(
                format!("{} {snippet}", bus.home.join("bin").join(script).display()),
                &bus.home,
                bus_log(&bus.home, name),
            )
            .with_startup_wait(bus.start_wait()),
            check_snippet: snippet,
        }
    };

    let etc = bus.home.join("etc");
    vec![
        component(
            "zookeeper",
            "zookeeper-server-start",
            etc.join("kafka").join("zookeeper.properties"),
        ),
        component(
            "kafka",
            "kafka-server-start",
            etc.join("kafka").join("server.properties"),
        ),
        component(
            "schema registry",
            "schema-registry-start",
            etc.join("schema-registry").join("schema-registry.properties"),
        ),
    ]
}

fn bus_log(home: &Path, name: &str) -> PathBuf {
    home.join("logs").join(format!("{}.log", name.replace(' ', "-")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeProcessTable;

    fn factory(interactive: bool) -> ProcessFactory {
        let mut config = PortalConfig::default();
        config.migration.task_id = "9".into();
        config.migration.interactive_password = interactive;
        config.source_database.password = "src-secret".into();
        config.tools.full_copy_home = PathBuf::from("/opt/replica");
        ProcessFactory::new(
            Arc::new(config),
            TaskWorkspace::new("/work", "9"),
            Arc::new(FakeProcessTable::new()),
        )
    }

    #[test]
    fn test_full_copy_command() {
        let factory = factory(false);
        let process = factory.full_copy(replica_orders::INIT_REPLICA);
        assert_eq!(
            process.spec().command,
            "/opt/replica/chameleon init_replica --config default_9 --source mysql"
        );
        assert_eq!(process.check_snippet(), process.spec().command);
        assert!(process.spec().stdin.is_none());
        assert!(process.spec().env.is_empty());

        let drop = factory.full_copy(replica_orders::DROP_REPLICA_SCHEMA);
        assert!(!drop.spec().command.contains("--source"));
    }

    #[test]
    fn test_detach_pipes_confirmation() {
        let process = factory(true).full_copy(replica_orders::DETACH_REPLICA);
        assert_eq!(process.spec().stdin.as_deref(), Some("YES"));
        assert!(process
            .spec()
            .env
            .contains(&("SOURCE_DB_PASSWORD".to_string(), "src-secret".to_string())));
        assert_eq!(
            process.policy(),
            &ExitPolicy::LogSentinel {
                log: PathBuf::from("/work/task_9/logs/full/full_migration.log"),
                sentinel: "detach_replica finished".into(),
            }
        );
    }

    #[test]
    fn test_stream_connector_snippet_is_in_command() {
        let factory = factory(false);
        let process = factory.stream_connector(StreamDirection::Reverse, StreamSide::Sink);
        assert!(process.spec().command.contains(process.check_snippet()));
        assert_eq!(process.kind(), ProcessKind::Stream(StreamDirection::Reverse, StreamSide::Sink));
        assert_eq!(
            process.status_artifact().map(|a| a.prefix.as_str()),
            Some("reverse-sink-process")
        );
        assert_eq!(process.policy(), &ExitPolicy::Streaming);
    }

    #[test]
    fn test_data_checker_policies() {
        let factory = factory(false);
        let full = factory.data_checker(PhaseArea::FullDataCheck, CheckerRole::Sink);
        assert!(full.check_snippet().ends_with("datachecker-extract.jar --sink"));
        assert!(matches!(full.policy(), ExitPolicy::SignFile { marker, .. } if marker.contains("SINK")));

        let incremental = factory.data_checker(PhaseArea::IncrementalDataCheck, CheckerRole::Check);
        assert_eq!(incremental.kind(), ProcessKind::IncrementalDataCheck);
        assert_eq!(incremental.policy(), &ExitPolicy::Background);
    }

    #[test]
    fn test_bus_components_in_start_order() {
        let components = bus_components(&BusConfig::default());
        let names: Vec<_> = components.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["zookeeper", "kafka", "schema registry"]);
        for component in &components {
            assert!(component.spec.command.contains(&component.check_snippet));
        }
    }
}
