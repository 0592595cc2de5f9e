//! Message-bus facade.
//!
//! Incremental and reverse streams exchange change events through a local
//! broker stack (coordinator, broker, schema registry). The portal starts
//! the stack, probes its health, restarts it with a bounded number of
//! attempts and cleans the topics a task leaves behind.

use crate::config::{BusConfig, SupervisionConfig};
use crate::error::{PortalError, PortalResult};
use crate::executor::StopIndicator;
use crate::logging::{log_cleanup_failure, log_process_operation};
use crate::process::adapters::{bus_components, BusComponent};
use crate::process::os::ProcessTable;
use crate::process::terminate;
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Attempts and back-off used by [`MessageBus::restart`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl From<&BusConfig> for RestartPolicy {
    fn from(config: &BusConfig) -> Self {
        Self {
            attempts: config.restart_attempts,
            backoff: config.restart_backoff(),
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync + fmt::Debug {
    /// Whether every component of the stack is alive
    async fn is_healthy(&self) -> bool;

    /// Start the components that are not running
    async fn start(&self) -> PortalResult<()>;

    /// Stop every running component, last started first
    async fn stop(&self);

    fn restart_policy(&self) -> RestartPolicy;

    async fn list_topics(&self) -> PortalResult<Vec<String>>;

    async fn delete_topic(&self, topic: &str) -> PortalResult<()>;

    /// Relax schema compatibility so re-created streams may register new schemas
    async fn reset_schema_compatibility(&self) -> PortalResult<()>;

    /// Stop and start the whole stack until it is healthy.
    ///
    /// Fails with [`PortalError::BusUnavailable`] once the configured
    /// attempts are exhausted; the stack is left stopped in that case.
    /// Gives up with [`PortalError::Stopped`] as soon as `stop` is set.
    async fn restart(&self, stop: &StopIndicator) -> PortalResult<()> {
        let policy = self.restart_policy();
        for attempt in 1..=policy.attempts {
            if stop.is_stopped() {
                info!(attempt = attempt, "Task stopping, abandoning message bus restart");
                return Err(PortalError::Stopped);
            }
            info!(attempt = attempt, max_attempts = policy.attempts, "🔄 Restarting message bus");
            self.stop().await;

            match self.start().await {
                Ok(()) if self.is_healthy().await => {
                    info!(attempt = attempt, "✅ Message bus restarted");
                    return Ok(());
                }
                Ok(()) => warn!(attempt = attempt, "Message bus started but is not healthy"),
                Err(e) => warn!(attempt = attempt, error = %e, "Message bus start failed"),
            }

            if attempt < policy.attempts {
                tokio::time::sleep(policy.backoff).await;
            }
        }

        self.stop().await;
        error!(attempts = policy.attempts, "❌ Failed to restart message bus");
        Err(PortalError::BusUnavailable {
            attempts: policy.attempts,
        })
    }
}

/// Restart the bus unless it is already healthy
pub async fn ensure_healthy(bus: &dyn MessageBus, stop: &StopIndicator) -> PortalResult<()> {
    if bus.is_healthy().await {
        return Ok(());
    }
    warn!("Message bus is not healthy before stream start");
    bus.restart(stop).await
}

/// Every topic derived from one stream server name
pub fn task_topics(server: &str) -> Vec<String> {
    let data = format!("{server}_topic");
    vec![
        format!("{data}_history"),
        format!("{data}_bp"),
        format!("config_{data}"),
        data,
    ]
}

/// Delete the task's topics that currently exist; failures are only logged
pub async fn clean_task_topics(bus: &dyn MessageBus, server: &str) {
    let existing = match bus.list_topics().await {
        Ok(topics) => topics,
        Err(e) => {
            log_cleanup_failure("message bus", "list topics", &e);
            return;
        }
    };

    for topic in task_topics(server) {
        if !existing.contains(&topic) {
            continue;
        }
        match bus.delete_topic(&topic).await {
            Ok(()) => debug!(topic = %topic, "Deleted topic"),
            Err(e) => log_cleanup_failure("message bus", &format!("delete topic {topic}"), &e),
        }
    }
}

/// Broker stack managed through its own launcher scripts
#[derive(Debug, Clone)]
pub struct KafkaBus {
    config: BusConfig,
    supervision: SupervisionConfig,
    components: Vec<BusComponent>,
    table: Arc<dyn ProcessTable>,
}

impl KafkaBus {
    pub fn new(config: BusConfig, supervision: SupervisionConfig, table: Arc<dyn ProcessTable>) -> Self {
        let components = bus_components(&config);
        Self {
            config,
            supervision,
            components,
            table,
        }
    }

    pub fn components(&self) -> &[BusComponent] {
        &self.components
    }

    async fn topics_command(&self, args: &[&str]) -> PortalResult<String> {
        let script = self.config.home.join("bin").join("kafka-topics");
        let output = Command::new(&script)
            .arg("--bootstrap-server")
            .arg(&self.config.bootstrap_servers)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| PortalError::Bus(format!("failed to run {}: {e}", script.display())))?;

        if !output.status.success() {
            return Err(PortalError::Bus(format!(
                "kafka-topics {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn is_healthy(&self) -> bool {
        for component in &self.components {
            if !self.table.is_running(&component.check_snippet).await {
                debug!(component = %component.name, "Message bus component is down");
                return false;
            }
        }
        true
    }

    async fn start(&self) -> PortalResult<()> {
        for component in &self.components {
            if self.table.is_running(&component.check_snippet).await {
                continue;
            }
            self.table.spawn(&component.name, &component.spec).await?;
            log_process_operation("start", &component.name, "running", None);
        }
        Ok(())
    }

    async fn stop(&self) {
        for component in self.components.iter().rev() {
            if self.table.is_running(&component.check_snippet).await {
                terminate(
                    self.table.as_ref(),
                    &component.name,
                    &component.check_snippet,
                    &self.supervision,
                )
                .await;
            }
        }
    }

    fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy::from(&self.config)
    }

    async fn list_topics(&self) -> PortalResult<Vec<String>> {
        let listing = self.topics_command(&["--list"]).await?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn delete_topic(&self, topic: &str) -> PortalResult<()> {
        self.topics_command(&["--delete", "--topic", topic]).await?;
        Ok(())
    }

    async fn reset_schema_compatibility(&self) -> PortalResult<()> {
        let url = format!("{}/config", self.config.schema_registry_url.trim_end_matches('/'));
        let status = Command::new("curl")
            .args([
                "-s",
                "-X",
                "PUT",
                "-H",
                "Content-Type: application/vnd.schemaregistry.v1+json",
                "--data",
                r#"{"compatibility": "NONE"}"#,
            ])
            .arg(&url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            return Err(PortalError::Bus(format!(
                "schema compatibility reset against {url} failed ({status})"
            )));
        }
        Ok(())
    }
}
