//! In-memory process table.
//!
//! Launched commands are kept in a list and matched by substring, exactly
//! like `ps` output is matched by the system table.

use crate::error::{PortalError, PortalResult};
use crate::process::os::{LaunchSpec, ProcessTable};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;

#[derive(Debug, Default)]
struct TableState {
    next_pid: u32,
    running: Vec<(u32, String)>,
    spawned: Vec<(String, LaunchSpec)>,
    kills: Vec<(String, bool)>,
    ignore_term: Vec<String>,
    fail_launch: Vec<String>,
    finish_on_spawn: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct FakeProcessTable {
    state: Mutex<TableState>,
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes whose command contains `pattern` survive SIGTERM
    pub fn ignore_term(&self, pattern: &str) {
        self.state.lock().ignore_term.push(pattern.to_string());
    }

    /// Launches whose command contains `pattern` fail
    pub fn fail_launch(&self, pattern: &str) {
        self.state.lock().fail_launch.push(pattern.to_string());
    }

    /// Launches whose command contains `pattern` exit at once after
    /// appending `log_line` to their log file
    pub fn finish_on_spawn(&self, pattern: &str, log_line: &str) {
        self.state
            .lock()
            .finish_on_spawn
            .push((pattern.to_string(), log_line.to_string()));
    }

    /// Let every process matching `snippet` exit on its own
    pub fn exit(&self, snippet: &str) {
        self.state
            .lock()
            .running
            .retain(|(_, command)| !command.contains(snippet));
    }

    /// Simulate a process left behind by an earlier controller
    pub fn start_external(&self, command: &str) {
        let mut state = self.state.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.running.push((pid, command.to_string()));
    }

    pub fn spawn_count(&self, snippet: &str) -> usize {
        self.state
            .lock()
            .spawned
            .iter()
            .filter(|(_, spec)| spec.command.contains(snippet))
            .count()
    }

    /// Kill requests whose snippet contains `snippet`, graceful and forced
    pub fn kill_count(&self, snippet: &str) -> usize {
        self.state
            .lock()
            .kills
            .iter()
            .filter(|(recorded, _)| recorded.contains(snippet))
            .count()
    }

    pub fn spawned(&self) -> Vec<(String, LaunchSpec)> {
        self.state.lock().spawned.clone()
    }

    /// Names of launched processes in launch order
    pub fn spawned_names(&self) -> Vec<String> {
        self.state
            .lock()
            .spawned
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn running_commands(&self) -> Vec<String> {
        self.state
            .lock()
            .running
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }
}

#[async_trait]
impl ProcessTable for FakeProcessTable {
    async fn spawn(&self, name: &str, spec: &LaunchSpec) -> PortalResult<()> {
        let mut state = self.state.lock();
        if state
            .fail_launch
            .iter()
            .any(|pattern| spec.command.contains(pattern.as_str()))
        {
            return Err(PortalError::launch(name, "command could not be executed"));
        }
        state.spawned.push((name.to_string(), spec.clone()));

        let finished = state
            .finish_on_spawn
            .iter()
            .find(|(pattern, _)| spec.command.contains(pattern.as_str()))
            .map(|(_, line)| line.clone());
        match finished {
            Some(line) => append_log(spec, &line),
            None => {
                state.next_pid += 1;
                let pid = state.next_pid;
                state.running.push((pid, spec.command.clone()));
                Ok(())
            }
        }
    }

    async fn find_pid(&self, snippet: &str) -> PortalResult<Option<u32>> {
        Ok(self
            .state
            .lock()
            .running
            .iter()
            .find(|(_, command)| command.contains(snippet))
            .map(|(pid, _)| *pid))
    }

    async fn kill_matching(&self, snippet: &str, force: bool) -> PortalResult<()> {
        let mut state = self.state.lock();
        state.kills.push((snippet.to_string(), force));
        let ignore = state.ignore_term.clone();
        state.running.retain(|(_, command)| {
            if !command.contains(snippet) {
                return true;
            }
            !force && ignore.iter().any(|pattern| command.contains(pattern.as_str()))
        });
        Ok(())
    }
}

fn append_log(spec: &LaunchSpec, line: &str) -> PortalResult<()> {
    if let Some(parent) = spec.log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_file)?;
    writeln!(log, "{line}")?;
    Ok(())
}
