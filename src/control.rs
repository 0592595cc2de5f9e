//! # Control Channel
//!
//! Local socket through which operator commands reach a running task.
//! Each connection carries one JSON-encoded [`OperatorCommand`] line and
//! gets one JSON [`ControlReply`] line back. The socket lives in the task
//! workspace, so only one controller can serve a task at a time.

use crate::error::{PortalError, PortalResult};
use crate::manager::MigrationManager;
use crate::state_machine::OperatorCommand;
use crate::workspace::TaskWorkspace;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SOCKET_FILE: &str = "portal.sock";

pub fn socket_path(workspace: &TaskWorkspace) -> PathBuf {
    workspace.home().join(SOCKET_FILE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    pub message: String,
}

impl ControlReply {
    fn from_result(result: PortalResult<String>) -> Self {
        match result {
            Ok(message) => Self {
                success: true,
                message,
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug)]
pub struct ControlServer {
    path: PathBuf,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind the task's socket and serve commands against `manager`.
    ///
    /// A socket file left by a dead controller is replaced; a live one makes
    /// binding fail.
    pub async fn bind(manager: Arc<MigrationManager>) -> PortalResult<Self> {
        let path = socket_path(manager.workspace());
        if path.exists() {
            if UnixStream::connect(&path).await.is_ok() {
                return Err(PortalError::PreconditionFailed(format!(
                    "another controller is serving task {}",
                    manager.workspace().id()
                )));
            }
            debug!(path = %path.display(), "Removing stale control socket");
            fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "🎛️ Control channel listening");

        let (shutdown, mut signal) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(manager, stream).await {
                                    warn!(error = %e, "Control connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "❌ Failed to accept control connection");
                        }
                    },
                    _ = signal.changed() => break,
                }
            }
        });

        Ok(Self {
            path,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
            }
        }
        debug!("Control channel closed");
    }
}

async fn serve_connection(manager: Arc<MigrationManager>, stream: UnixStream) -> PortalResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;

    let reply = match serde_json::from_str::<OperatorCommand>(line.trim()) {
        Ok(command) => {
            info!(command = %command, "Operator command received");
            ControlReply::from_result(manager.execute(command).await)
        }
        Err(e) => ControlReply {
            success: false,
            message: format!("malformed command: {e}"),
        },
    };

    let mut payload = serde_json::to_string(&reply)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}

/// Send `command` to the controller serving `workspace`
pub async fn send_command(workspace: &TaskWorkspace, command: OperatorCommand) -> PortalResult<ControlReply> {
    let path = socket_path(workspace);
    let stream = UnixStream::connect(&path).await.map_err(|e| {
        PortalError::PreconditionFailed(format!(
            "no controller is serving task {} ({e})",
            workspace.id()
        ))
    })?;
    let (reader, mut writer) = stream.into_split();

    let mut payload = serde_json::to_string(&command)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await?;
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::manager::ManagerServices;
    use crate::state_machine::MigrationStatus;
    use crate::test_helpers::{FakeBus, FakeDatabaseAdmin, FakeProcessTable};
    use tempfile::TempDir;

    fn manager(root: &Path) -> Arc<MigrationManager> {
        let mut config = PortalConfig::default();
        config.migration.task_id = "3".into();
        config.migration.mode = "plan3".into();
        config.workspace.root = root.to_path_buf();
        config.workspace.data_dir = root.join("data");
        MigrationManager::with_services(
            Arc::new(config),
            ManagerServices {
                table: Arc::new(FakeProcessTable::new()),
                bus: Arc::new(FakeBus::new()),
                target_admin: Arc::new(FakeDatabaseAdmin::new()),
                source_admin: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejected_command_round_trips_as_success_reply() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        let workspace = manager.workspace().clone();
        let server = ControlServer::bind(Arc::clone(&manager)).await.unwrap();

        let reply = send_command(&workspace, OperatorCommand::StopReverse).await.unwrap();

        assert!(reply.success);
        assert!(reply.message.starts_with("stop_reverse rejected"));
        assert_eq!(manager.current_status(), MigrationStatus::NotStarted);
        server.stop().await;
        assert!(!socket_path(&workspace).exists());
    }

    #[tokio::test]
    async fn test_second_controller_cannot_bind() {
        let root = TempDir::new().unwrap();
        let manager = manager(root.path());
        let server = ControlServer::bind(Arc::clone(&manager)).await.unwrap();

        let err = ControlServer::bind(Arc::clone(&manager)).await.unwrap_err();

        assert!(matches!(err, PortalError::PreconditionFailed(_)));
        server.stop().await;
    }

    #[tokio::test]
    async fn test_missing_controller_is_reported() {
        let root = TempDir::new().unwrap();
        let workspace = TaskWorkspace::new(root.path(), "4");
        workspace.create().unwrap();

        let err = send_command(&workspace, OperatorCommand::Stop).await.unwrap_err();
        assert!(err.to_string().contains("no controller is serving task 4"));
    }
}
