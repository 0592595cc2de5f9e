//! Operator phase commands.
//!
//! Each command is checked with [`guards::evaluate`] first. A rejected
//! command is logged as a warning and returned to the caller; it never
//! fails the task.

use super::MigrationJob;
use crate::config::SourceType;
use crate::error::PortalResult;
use crate::logging::log_phase_operation;
use crate::state_machine::{guards, MigrationPhase, MigrationStatus, PhaseOperation, TransitionDecision};
use crate::tasks::PhaseTask;
use std::sync::atomic::Ordering;
use tracing::{info, warn};

impl MigrationJob {
    fn decide(&self, operation: PhaseOperation, phase: MigrationPhase) -> TransitionDecision {
        let status = self.status.current_status();
        let decision = guards::evaluate(operation, phase, status, &self.phases);
        match &decision {
            TransitionDecision::Rejected(rejection) => {
                warn!(
                    operation = %operation,
                    phase = %phase,
                    status = %status,
                    reason = %rejection,
                    "⚠️ Operation rejected"
                );
            }
            _ => log_phase_operation(
                operation.operation_type(),
                self.task_id(),
                phase.phase_name(),
                status.description(),
                None,
            ),
        }
        decision
    }

    pub async fn stop_incremental(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Stop, MigrationPhase::IncrementalMigration);
        if !decision.is_allowed() {
            return Ok(decision);
        }

        self.stop_incremental_streams().await;
        self.migrate_deferred_foreign_keys().await;

        if !self.ctx.stop.is_stopped() && !self.before_reverse_done.load(Ordering::Acquire) {
            if let Some(reverse) = &self.tasks.reverse {
                reverse.before_task().await?;
                self.before_reverse_done.store(true, Ordering::Release);
            }
        }
        self.set_status(MigrationStatus::IncrementalFinished);
        info!(task_id = %self.task_id(), "Incremental migration stopped");
        Ok(decision)
    }

    async fn stop_incremental_streams(&self) {
        self.set_status(MigrationStatus::IncrementalStopping);
        if let Some(check) = &self.tasks.incremental_check {
            check.stop().await;
        }
        if let Some(incremental) = &self.tasks.incremental {
            incremental.stop().await;
        }
    }

    pub async fn resume_incremental(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Resume, MigrationPhase::IncrementalMigration);
        if !decision.is_allowed() {
            return Ok(decision);
        }

        if let Some(incremental) = &self.tasks.incremental {
            incremental.resume_task().await?;
        }
        self.set_status(MigrationStatus::IncrementalRunning);
        info!(task_id = %self.task_id(), "Incremental migration resumed");
        Ok(decision)
    }

    pub async fn restart_incremental(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Restart, MigrationPhase::IncrementalMigration);
        if !decision.is_allowed() || self.ctx.stop.is_stopped() {
            return Ok(decision);
        }

        if decision == TransitionDecision::AllowedAfterStop {
            self.stop_incremental_streams().await;
            self.set_status(MigrationStatus::IncrementalFinished);
        }
        self.clear_before_reverse().await;

        self.set_status(MigrationStatus::IncrementalStarting);
        if let Some(incremental) = &self.tasks.incremental {
            incremental.start_source().await?;
            incremental.start_sink().await?;
        }
        if let Some(check) = &self.tasks.incremental_check {
            check.start().await?;
        }
        self.set_status(MigrationStatus::IncrementalRunning);
        info!(task_id = %self.task_id(), "🔄 Incremental migration restarted");
        Ok(decision)
    }

    pub async fn start_reverse(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Start, MigrationPhase::ReverseMigration);
        if !decision.is_allowed() || self.ctx.stop.is_stopped() {
            return Ok(decision);
        }
        let Some(reverse) = &self.tasks.reverse else {
            return Ok(decision);
        };

        if self.source_type() == SourceType::Postgresql {
            if let Some(incremental) = &self.tasks.incremental {
                incremental.after_task().await;
            }
        }

        if !self.verify_reverse().await {
            self.set_status(MigrationStatus::PreReverseVerifyFailed);
            warn!(task_id = %self.task_id(), "Reverse migration verification failed, reverse migration skipped");
            return Ok(decision);
        }

        if !self.before_reverse_done.load(Ordering::Acquire) {
            reverse.before_task().await?;
            self.before_reverse_done.store(true, Ordering::Release);
        }
        self.execute_reverse(reverse).await?;
        info!(task_id = %self.task_id(), "Reverse migration started");
        Ok(decision)
    }

    pub async fn stop_reverse(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Stop, MigrationPhase::ReverseMigration);
        if !decision.is_allowed() {
            return Ok(decision);
        }

        self.stop_reverse_streams().await;
        info!(task_id = %self.task_id(), "Reverse migration stopped");
        Ok(decision)
    }

    async fn stop_reverse_streams(&self) {
        self.set_status(MigrationStatus::ReverseStopping);
        if let Some(reverse) = &self.tasks.reverse {
            reverse.stop().await;
        }
        self.set_status(MigrationStatus::ReverseFinished);
    }

    pub async fn resume_reverse(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Resume, MigrationPhase::ReverseMigration);
        if !decision.is_allowed() {
            return Ok(decision);
        }

        if let Some(reverse) = &self.tasks.reverse {
            reverse.resume_task().await?;
        }
        self.set_status(MigrationStatus::ReverseRunning);
        info!(task_id = %self.task_id(), "Reverse migration resumed");
        Ok(decision)
    }

    pub async fn restart_reverse(&self) -> PortalResult<TransitionDecision> {
        let _guard = self.operations.lock().await;
        let decision = self.decide(PhaseOperation::Restart, MigrationPhase::ReverseMigration);
        if !decision.is_allowed() || self.ctx.stop.is_stopped() {
            return Ok(decision);
        }
        let Some(reverse) = &self.tasks.reverse else {
            return Ok(decision);
        };

        if decision == TransitionDecision::AllowedAfterStop {
            self.stop_reverse_streams().await;
        }
        self.execute_reverse(reverse).await?;
        info!(task_id = %self.task_id(), "🔄 Reverse migration restarted");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::super::JobResources;
    use super::*;
    use crate::config::{MigrationMode, PortalConfig};
    use crate::progress::VectorProgress;
    use crate::state_machine::Rejection;
    use crate::test_helpers::{FakeDatabaseAdmin, TaskFixture};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Setup {
        _root: TempDir,
        fx: TaskFixture,
        admin: Arc<FakeDatabaseAdmin>,
        job: Arc<MigrationJob>,
    }

    fn setup(phases: Vec<MigrationPhase>) -> Setup {
        let root = TempDir::new().unwrap();
        let fx = TaskFixture::new(root.path(), PortalConfig::default()).unwrap();
        let admin = Arc::new(FakeDatabaseAdmin::new().with_tables("1", &["orders"]));
        let job = Arc::new(MigrationJob::new(
            fx.ctx.clone(),
            &MigrationMode::new("custom", phases),
            Arc::clone(&fx.status),
            JobResources {
                target_admin: admin.clone(),
                source_admin: None,
                vector_progress: Arc::new(VectorProgress::new()),
            },
        ));
        Setup {
            _root: root,
            fx,
            admin,
            job,
        }
    }

    fn reverse_only() -> Setup {
        setup(vec![MigrationPhase::ReverseMigration])
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_incremental_requires_interrupted() {
        let s = setup(vec![MigrationPhase::IncrementalMigration]);
        s.fx.status.set_current_status(MigrationStatus::IncrementalRunning);

        let decision = s.job.resume_incremental().await.unwrap();

        assert!(!decision.is_allowed());
        assert!(s.fx.table.spawned().is_empty());
        assert_eq!(s.fx.status.current_status(), MigrationStatus::IncrementalRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reverse_rejected_when_finished() {
        let s = reverse_only();
        s.fx.status.set_current_status(MigrationStatus::ReverseFinished);

        let decision = s.job.stop_reverse().await.unwrap();

        assert!(matches!(
            decision,
            TransitionDecision::Rejected(Rejection::IllegalState { .. })
        ));
        assert_eq!(s.fx.status.current_status(), MigrationStatus::ReverseFinished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reverse_from_finished_starts_without_stop() {
        let s = reverse_only();
        s.fx.status.set_current_status(MigrationStatus::ReverseFinished);

        let decision = s.job.restart_reverse().await.unwrap();

        assert_eq!(decision, TransitionDecision::Allowed);
        assert_eq!(s.fx.table.spawned_names(), vec!["reverse source", "reverse sink"]);
        assert_eq!(s.fx.table.kill_count("connector.properties"), 0);
        assert_eq!(s.fx.status.current_status(), MigrationStatus::ReverseRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_reverse_from_running_stops_first() {
        let s = reverse_only();
        s.job.start_task().await.unwrap();
        assert_eq!(s.fx.status.current_status(), MigrationStatus::ReverseRunning);

        let decision = s.job.restart_reverse().await.unwrap();

        assert_eq!(decision, TransitionDecision::AllowedAfterStop);
        assert_eq!(s.fx.table.spawn_count("reverse"), 4);
        assert_eq!(s.fx.table.running_commands().len(), 2);
        let history: Vec<_> = s.fx.status.history().iter().map(|r| r.status).collect();
        assert!(history.contains(&MigrationStatus::ReverseStopping));
        assert_eq!(s.fx.status.current_status(), MigrationStatus::ReverseRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reverse_verify_failure_sets_status() {
        let s = setup(vec![MigrationPhase::FullDataCheck, MigrationPhase::ReverseMigration]);
        s.fx.status.set_current_status(MigrationStatus::FullDataCheckFinished);
        s.admin.set_setting("wal_level", "replica");

        let decision = s.job.start_reverse().await.unwrap();

        assert!(decision.is_allowed());
        assert_eq!(s.fx.status.current_status(), MigrationStatus::PreReverseVerifyFailed);
        assert!(s.fx.table.spawned().is_empty());
        assert!(s.admin.slots().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reverse_prepares_once() {
        let s = setup(vec![MigrationPhase::FullDataCheck, MigrationPhase::ReverseMigration]);
        s.fx.status.set_current_status(MigrationStatus::FullDataCheckFinished);

        s.job.start_reverse().await.unwrap();
        let again = s.job.start_reverse().await.unwrap();

        assert!(matches!(
            again,
            TransitionDecision::Rejected(Rejection::AlreadyInPhase { .. })
        ));
        assert_eq!(s.admin.slots(), vec!["reverse_slot_1".to_string()]);
        assert_eq!(s.fx.status.current_status(), MigrationStatus::ReverseRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reverse_waits_for_predecessor() {
        let s = setup(vec![MigrationPhase::FullDataCheck, MigrationPhase::ReverseMigration]);
        s.fx.status.set_current_status(MigrationStatus::FullDataCheckRunning);

        let decision = s.job.start_reverse().await.unwrap();

        assert!(matches!(
            decision,
            TransitionDecision::Rejected(Rejection::PredecessorNotFinished { .. })
        ));
        assert!(s.fx.table.spawned().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_phase_is_rejected() {
        let s = setup(vec![MigrationPhase::FullMigration]);

        let decision = s.job.stop_incremental().await.unwrap();

        assert_eq!(
            decision,
            TransitionDecision::Rejected(Rejection::PhaseDisabled {
                phase: MigrationPhase::IncrementalMigration
            })
        );
    }
}
