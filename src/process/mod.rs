//! # Process Supervision
//!
//! One [`TaskProcess`] wraps one external engine invocation: launch with a
//! bounded startup wait, liveness by command-line match, lazy detection of
//! abnormal exit, graceful stop escalating to a forced kill, and a blocking
//! wait for engines that finish on their own.

pub mod adapters;
pub mod monitor;
pub mod os;

use crate::config::SupervisionConfig;
use crate::error::{PortalError, PortalResult};
use crate::executor::StopIndicator;
use crate::logging::log_process_operation;
use crate::workspace::latest_status_file;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use monitor::{MonitorEvent, ProcessMonitor};
pub use os::{LaunchSpec, ProcessTable, SystemProcessTable};

/// Direction of a change-stream connector pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Incremental,
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSide {
    Source,
    Sink,
}

/// What a supervised process does, used to route failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    FullMigration,
    FullDataCheck,
    IncrementalDataCheck,
    Stream(StreamDirection, StreamSide),
}

impl ProcessKind {
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(..))
    }

    pub fn is_data_check(&self) -> bool {
        matches!(self, Self::FullDataCheck | Self::IncrementalDataCheck)
    }
}

/// How a process that is no longer alive is judged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPolicy {
    /// Clean exit iff the last line of `log` contains `sentinel`
    LogSentinel { log: PathBuf, sentinel: String },
    /// Clean exit iff `path` contains `marker`
    SignFile { path: PathBuf, marker: String },
    /// Never exits on its own; any exit is abnormal and waiting is refused
    Streaming,
    /// Runs alongside another phase; any exit is abnormal, waiting returns at once
    Background,
}

/// Status snapshot a streaming engine keeps rewriting while it is healthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusArtifact {
    pub dir: PathBuf,
    pub prefix: String,
}

impl StatusArtifact {
    pub fn latest(&self) -> Option<PathBuf> {
        latest_status_file(&self.dir, &self.prefix)
    }
}

/// Operations every supervised engine supports
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;

    /// Launch; a no-op if already started
    async fn start(&self) -> PortalResult<()>;

    /// Idempotent stop; always leaves the process marked stopped
    async fn stop(&self);

    async fn is_alive(&self) -> bool;

    /// Detect abnormal exit; returns whether the process is still normal
    async fn check_status(&self) -> bool;

    /// Block until the process is stopped or has exited
    async fn wait_exit(&self) -> PortalResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct ProcessState {
    started: bool,
    stopped: bool,
    normal: bool,
}

impl Default for ProcessState {
    fn default() -> Self {
        Self {
            started: false,
            stopped: false,
            normal: true,
        }
    }
}

/// A supervised external engine invocation
pub struct TaskProcess {
    name: String,
    kind: ProcessKind,
    spec: LaunchSpec,
    check_snippet: String,
    policy: ExitPolicy,
    status_artifact: Option<StatusArtifact>,
    table: Arc<dyn ProcessTable>,
    supervision: SupervisionConfig,
    stop: StopIndicator,
    state: Mutex<ProcessState>,
}

impl TaskProcess {
    pub fn new(
        name: impl Into<String>,
        kind: ProcessKind,
        spec: LaunchSpec,
        check_snippet: impl Into<String>,
        policy: ExitPolicy,
        table: Arc<dyn ProcessTable>,
        supervision: SupervisionConfig,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            spec,
            check_snippet: check_snippet.into(),
            policy,
            status_artifact: None,
            table,
            supervision,
            stop: StopIndicator::new(),
            state: Mutex::new(ProcessState::default()),
        }
    }

    /// Let [`Supervised::wait_exit`] return early once the task stops
    pub fn with_stop_indicator(mut self, stop: StopIndicator) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_status_artifact(mut self, artifact: StatusArtifact) -> Self {
        self.status_artifact = Some(artifact);
        self
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn check_snippet(&self) -> &str {
        &self.check_snippet
    }

    pub fn policy(&self) -> &ExitPolicy {
        &self.policy
    }

    pub fn status_artifact(&self) -> Option<&StatusArtifact> {
        self.status_artifact.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn is_normal(&self) -> bool {
        self.state.lock().normal
    }

    /// Judge an exited process by its policy; `None` when undecidable this tick
    fn judge_exit(&self) -> Option<bool> {
        match &self.policy {
            ExitPolicy::LogSentinel { log, sentinel } => match read_last_line(log) {
                Ok(line) => Some(line.contains(sentinel.as_str())),
                Err(e) => {
                    warn!(
                        process = %self.name,
                        log = %log.display(),
                        error = %e,
                        "Failed to read process log"
                    );
                    None
                }
            },
            ExitPolicy::SignFile { path, marker } => match fs::read_to_string(path) {
                Ok(contents) => Some(contents.contains(marker.as_str())),
                Err(e) => {
                    warn!(process = %self.name, path = %path.display(), error = %e, "Failed to read sign file");
                    Some(false)
                }
            },
            ExitPolicy::Streaming | ExitPolicy::Background => Some(false),
        }
    }
}

#[async_trait]
impl Supervised for TaskProcess {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> PortalResult<()> {
        if self.is_started() {
            return Ok(());
        }

        self.table.spawn(&self.name, &self.spec).await?;
        *self.state.lock() = ProcessState {
            started: true,
            stopped: false,
            normal: true,
        };

        log_process_operation("start", &self.name, "running", None);
        Ok(())
    }

    async fn stop(&self) {
        let already_stopped = self.is_stopped();
        if already_stopped && !self.is_alive().await {
            return;
        }

        self.state.lock().stopped = true;
        terminate(self.table.as_ref(), &self.name, &self.check_snippet, &self.supervision).await;
    }

    async fn is_alive(&self) -> bool {
        self.table.is_running(&self.check_snippet).await
    }

    async fn check_status(&self) -> bool {
        {
            let state = self.state.lock();
            if !state.started || state.stopped {
                return state.normal;
            }
        }

        if self.is_alive().await {
            return self.is_normal();
        }

        let Some(clean) = self.judge_exit() else {
            return self.is_normal();
        };

        let mut state = self.state.lock();
        // stop() may have raced with the liveness probe
        if state.stopped {
            return state.normal;
        }
        state.stopped = true;
        if clean {
            info!(process = %self.name, "✅ {} has finished", self.name);
        } else {
            state.normal = false;
            error!(process = %self.name, "❌ {} exited abnormally", self.name);
        }
        state.normal
    }

    async fn wait_exit(&self) -> PortalResult<()> {
        match self.policy {
            ExitPolicy::Streaming => return Err(PortalError::unsupported(&self.name, "wait_exit")),
            ExitPolicy::Background => return Ok(()),
            ExitPolicy::LogSentinel { .. } | ExitPolicy::SignFile { .. } => {}
        }

        loop {
            if self.stop.is_stopped() {
                debug!(process = %self.name, "Task stopping, no longer waiting for exit");
                return Ok(());
            }
            {
                let state = self.state.lock();
                if !state.started || state.stopped {
                    return Ok(());
                }
            }
            tokio::time::sleep(self.supervision.wait_exit_poll()).await;
            self.check_status().await;
        }
    }
}

impl fmt::Debug for TaskProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.lock();
        f.debug_struct("TaskProcess")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("check_snippet", &self.check_snippet)
            .field("started", &state.started)
            .field("stopped", &state.stopped)
            .field("normal", &state.normal)
            .finish()
    }
}

/// Terminate every process matching `snippet`, escalating to a forced kill
/// when it outlives the stop window.
pub async fn terminate(
    table: &dyn ProcessTable,
    name: &str,
    snippet: &str,
    supervision: &SupervisionConfig,
) {
    if let Err(e) = table.kill_matching(snippet, false).await {
        warn!(process = %name, error = %e, "Failed to signal process");
    }

    let poll = supervision.stop_poll();
    let mut remaining = supervision.stop_window();
    while !remaining.is_zero() {
        tokio::time::sleep(poll).await;
        remaining = remaining.saturating_sub(poll);
        if !table.is_running(snippet).await {
            log_process_operation("stop", name, "stopped", None);
            return;
        }
    }

    if let Err(e) = table.kill_matching(snippet, true).await {
        warn!(process = %name, error = %e, "Failed to force kill process");
    }

    if table.is_running(snippet).await {
        let pid = table.find_pid(snippet).await.ok().flatten();
        error!(
            process = %name,
            pid = ?pid,
            "❌ Failed to stop {}, please kill it manually",
            name
        );
    } else {
        log_process_operation("stop", name, "killed", Some("forced after stop window"));
    }
}

fn read_last_line(path: &std::path::Path) -> std::io::Result<String> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .to_string())
}
