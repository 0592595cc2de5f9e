//! OS process table access.
//!
//! Supervised engines are found by a snippet of their command line rather
//! than a cached PID, so a controller restarted mid-task still finds the
//! engines the previous controller launched.

use crate::error::{PortalError, PortalResult};
use async_trait::async_trait;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Everything needed to launch one engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Full command line, run through `sh -c`
    pub command: String,
    pub work_dir: PathBuf,
    /// stdout and stderr are appended here
    pub log_file: PathBuf,
    pub env: Vec<(String, String)>,
    /// Line written to stdin right after launch
    pub stdin: Option<String>,
    /// Bounded wait after launch that surfaces immediate failures
    pub startup_wait: Duration,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>, work_dir: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
            log_file: log_file.into(),
            env: Vec::new(),
            stdin: None,
            startup_wait: Duration::from_secs(1),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_startup_wait(mut self, wait: Duration) -> Self {
        self.startup_wait = wait;
        self
    }
}

/// Seam over the operating system's process table
#[async_trait]
pub trait ProcessTable: Send + Sync + fmt::Debug {
    /// Launch a detached process and wait `spec.startup_wait` for early failure
    async fn spawn(&self, name: &str, spec: &LaunchSpec) -> PortalResult<()>;

    /// PID of the first process whose command line contains `snippet`
    async fn find_pid(&self, snippet: &str) -> PortalResult<Option<u32>>;

    /// Signal every process whose command line contains `snippet`
    async fn kill_matching(&self, snippet: &str, force: bool) -> PortalResult<()>;

    async fn is_running(&self, snippet: &str) -> bool {
        match self.find_pid(snippet).await {
            Ok(pid) => pid.is_some(),
            Err(e) => {
                warn!(snippet = %snippet, error = %e, "Failed to query process table");
                false
            }
        }
    }
}

/// [`ProcessTable`] backed by `sh`, `ps` and `kill`
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTable;

impl SystemProcessTable {
    pub fn new() -> Self {
        Self
    }

    async fn matching_pids(&self, snippet: &str) -> PortalResult<Vec<u32>> {
        let output = Command::new("ps")
            .args(["-eo", "pid=,args="])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await?;

        let own_pid = std::process::id();
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ps_listing(&listing, snippet)
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect())
    }
}

#[async_trait]
impl ProcessTable for SystemProcessTable {
    async fn spawn(&self, name: &str, spec: &LaunchSpec) -> PortalResult<()> {
        if let Some(parent) = spec.log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)?;
        let stderr = stdout.try_clone()?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(format!("exec {}", spec.command))
            .current_dir(&spec.work_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        #[cfg(unix)]
        command.process_group(0);

        debug!(process = %name, command = %spec.command, work_dir = %spec.work_dir.display(), "Launching process");
        let mut child = command.spawn().map_err(|e| PortalError::launch(name, e))?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(format!("{input}\n").as_bytes()).await?;
                stdin.flush().await?;
            }
        }

        match tokio::time::timeout(spec.startup_wait, child.wait()).await {
            // Shell could not find or execute the command
            Ok(Ok(status)) if matches!(status.code(), Some(126 | 127)) => Err(PortalError::launch(
                name,
                format!("command could not be executed ({status})"),
            )),
            Ok(Ok(status)) => {
                debug!(process = %name, status = %status, "Process exited during startup wait");
                Ok(())
            }
            Ok(Err(e)) => Err(PortalError::launch(name, e)),
            Err(_) => Ok(()),
        }
    }

    async fn find_pid(&self, snippet: &str) -> PortalResult<Option<u32>> {
        Ok(self.matching_pids(snippet).await?.into_iter().next())
    }

    async fn kill_matching(&self, snippet: &str, force: bool) -> PortalResult<()> {
        let signal = if force { "-9" } else { "-15" };
        for pid in self.matching_pids(snippet).await? {
            let status = Command::new("kill")
                .arg(signal)
                .arg(pid.to_string())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await?;
            if !status.success() {
                debug!(pid = pid, signal = signal, "kill reported failure, process may have exited");
            }
        }
        Ok(())
    }
}

/// Extract PIDs from `ps -eo pid=,args=` output whose arguments contain `snippet`
pub fn parse_ps_listing(listing: &str, snippet: &str) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            if !args.contains(snippet) || args.contains("ps -eo") {
                return None;
            }
            pid.parse().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_listing() {
        let listing = "\
    1 /sbin/init
  420 java -jar checker.jar --source
  421 java -jar checker.jar --sink
  999 ps -eo pid=,args= checker.jar
";
        assert_eq!(parse_ps_listing(listing, "checker.jar --sink"), vec![421]);
        assert_eq!(parse_ps_listing(listing, "checker.jar"), vec![420, 421]);
        assert!(parse_ps_listing(listing, "kafka").is_empty());
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("tool detach_replica", "/opt/tool", "/tmp/full.log")
            .with_stdin("YES")
            .with_startup_wait(Duration::from_secs(2));
        assert_eq!(spec.stdin.as_deref(), Some("YES"));
        assert_eq!(spec.startup_wait, Duration::from_secs(2));
        assert!(spec.env.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_missing_command() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = LaunchSpec::new(
            "definitely-not-an-installed-engine --run",
            dir.path(),
            dir.path().join("logs").join("engine.log"),
        )
        .with_startup_wait(Duration::from_secs(5));

        let err = SystemProcessTable::new().spawn("engine", &spec).await.unwrap_err();
        assert!(matches!(err, PortalError::ProcessLaunch { .. }));
        assert!(dir.path().join("logs").join("engine.log").exists());
    }
}
