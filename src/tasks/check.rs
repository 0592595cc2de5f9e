//! Data consistency checks.
//!
//! A check runs three cooperating checker processes: source extract, sink
//! extract and the comparing check. The full check blocks until all three
//! exit; the incremental check runs beside the incremental stream and is
//! handed to the process monitor instead.

use super::{clear_history, PhaseTask, TaskContext};
use crate::error::{PortalError, PortalResult};
use crate::process::adapters::CheckerRole;
use crate::process::{Supervised, TaskProcess};
use crate::tools::ensure_healthy;
use crate::workspace::PhaseArea;
use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct CheckTask {
    ctx: TaskContext,
    area: PhaseArea,
    processes: Mutex<Vec<Arc<TaskProcess>>>,
}

impl CheckTask {
    pub fn full(ctx: TaskContext) -> Self {
        Self::new(ctx, PhaseArea::FullDataCheck)
    }

    pub fn incremental(ctx: TaskContext) -> Self {
        Self::new(ctx, PhaseArea::IncrementalDataCheck)
    }

    fn new(ctx: TaskContext, area: PhaseArea) -> Self {
        Self {
            ctx,
            area,
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn area(&self) -> PhaseArea {
        self.area
    }

    fn is_incremental(&self) -> bool {
        self.area == PhaseArea::IncrementalDataCheck
    }

    pub fn processes(&self) -> Vec<Arc<TaskProcess>> {
        self.processes.lock().clone()
    }
}

#[async_trait]
impl PhaseTask for CheckTask {
    fn name(&self) -> &str {
        if self.is_incremental() {
            "incremental data check"
        } else {
            "full data check"
        }
    }

    async fn before_task(&self) -> PortalResult<()> {
        let workspace = self.ctx.workspace();
        clear_history(self.name(), &workspace.status_dir(self.area));
        clear_history(self.name(), &workspace.logs_dir(self.area));
        fs::create_dir_all(workspace.check_result_dir(self.area))?;

        ensure_healthy(self.ctx.bus.as_ref(), &self.ctx.stop).await
    }

    async fn start(&self) -> PortalResult<()> {
        if self.ctx.stop.is_stopped() {
            debug!(task = %self.name(), "Task stopping, not starting checkers");
            return Ok(());
        }

        let processes: Vec<Arc<TaskProcess>> = CheckerRole::ALL
            .iter()
            .map(|role| {
                Arc::new(
                    self.ctx
                        .factory
                        .data_checker(self.area, *role)
                        .with_stop_indicator(self.ctx.stop.clone()),
                )
            })
            .collect();
        *self.processes.lock() = processes.clone();

        info!(task = %self.name(), "🔍 Starting data checkers");
        try_join_all(processes.iter().map(|process| process.start())).await?;

        if self.is_incremental() {
            for process in processes {
                self.ctx.monitor.register(process);
            }
            return Ok(());
        }

        for process in &processes {
            process.wait_exit().await?;
            if self.ctx.stop.is_stopped() {
                debug!(task = %self.name(), "Task stopping, data check abandoned");
                return Ok(());
            }
            if !process.check_status().await {
                return Err(PortalError::ProcessAbnormalExit {
                    name: process.name().to_string(),
                });
            }
        }
        info!(task = %self.name(), "✅ Data check finished");
        Ok(())
    }

    async fn stop(&self) {
        let processes = self.processes();
        for process in processes {
            process.stop().await;
        }
    }

    async fn after_task(&self) {
        debug!(task = %self.name(), "Nothing to release after data check");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::constants::sentinels;
    use crate::test_helpers::TaskFixture;
    use tempfile::TempDir;

    fn write_stop_signs(fx: &TaskFixture, markers: &[&str]) {
        let sign = fx.workspace.check_sign_file(PhaseArea::FullDataCheck);
        fs::write(sign, markers.join("\n")).unwrap();
    }

    fn finish_checkers(fx: &TaskFixture) {
        for role in CheckerRole::ALL {
            fx.table
                .finish_on_spawn(&format!("application-{}.yml", role.role_name()), "stopped");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_check_waits_for_all_roles() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        let task = CheckTask::full(fx.ctx.clone());

        task.before_task().await.unwrap();
        finish_checkers(&fx);
        write_stop_signs(
            &fx,
            &[
                sentinels::CHECK_SOURCE_STOP,
                sentinels::CHECK_SINK_STOP,
                sentinels::CHECK_CHECK_STOP,
            ],
        );
        task.start().await.unwrap();

        assert_eq!(fx.table.spawned().len(), 3);
        assert!(task.processes().iter().all(|p| p.is_stopped() && p.is_normal()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_check_missing_stop_sign_fails() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        let task = CheckTask::full(fx.ctx.clone());

        task.before_task().await.unwrap();
        finish_checkers(&fx);
        write_stop_signs(&fx, &[sentinels::CHECK_SOURCE_STOP, sentinels::CHECK_SINK_STOP]);

        let err = task.start().await.unwrap_err();
        assert!(
            matches!(err, PortalError::ProcessAbnormalExit { ref name } if name == "full data check check")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_check_is_monitored() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        let task = CheckTask::incremental(fx.ctx.clone());

        task.before_task().await.unwrap();
        task.start().await.unwrap();

        assert_eq!(fx.monitor.watched_count(), 3);
        task.stop().await;
        assert!(fx.table.running_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_bus_is_restarted_first() {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        fx.bus.set_healthy(false);
        let task = CheckTask::full(fx.ctx.clone());

        task.before_task().await.unwrap();

        assert_eq!(fx.bus.start_calls(), 1);
    }
}
