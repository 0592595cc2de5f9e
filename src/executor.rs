//! # Task Executor
//!
//! Ordered, cancellable sequence of steps for one phase invocation. The
//! executor only orders steps and honours the shared [`StopIndicator`];
//! retries and compensation belong to the job that builds the queue.
//!
//! ```rust
//! use migration_portal::executor::{ExecutionOutcome, StopIndicator, TaskExecutor};
//!
//! # tokio_test::block_on(async {
//! let stop = StopIndicator::new();
//! let mut executor = TaskExecutor::new(stop.clone());
//! executor.add_step("prepare", || async { Ok(()) });
//! let cancel = stop.clone();
//! executor.add_step("cancel", move || async move {
//!     cancel.set();
//!     Ok(())
//! });
//! executor.add_step("never runs", || async { Ok(()) });
//!
//! let outcome = executor.execute().await.unwrap();
//! assert_eq!(outcome, ExecutionOutcome::Cancelled { at: 2 });
//! # });
//! ```

use crate::error::PortalResult;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Shared cancellation flag for one task run.
///
/// Once set it is never cleared; a new run gets a new indicator.
#[derive(Debug, Clone, Default)]
pub struct StopIndicator {
    stopped: Arc<AtomicBool>,
}

impl StopIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!("🛑 Stop requested, no new steps will start");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

type Step = Box<dyn FnOnce() -> BoxFuture<'static, PortalResult<()>> + Send>;

/// Outcome of [`TaskExecutor::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    /// The stop indicator was set before step `at` (zero-based) began
    Cancelled { at: usize },
}

pub struct TaskExecutor {
    stop: StopIndicator,
    steps: Vec<(String, Step)>,
}

impl TaskExecutor {
    pub fn new(stop: StopIndicator) -> Self {
        Self {
            stop,
            steps: Vec::new(),
        }
    }

    /// Append a named step
    pub fn add_step<F, Fut>(&mut self, name: impl Into<String>, step: F) -> &mut Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = PortalResult<()>> + Send + 'static,
    {
        self.steps
            .push((name.into(), Box::new(move || Box::pin(step()) as BoxFuture<'static, _>)));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run all steps in order.
    ///
    /// The first failing step ends execution and its error is returned
    /// unchanged. Remaining steps are dropped without running when the stop
    /// indicator is set.
    pub async fn execute(self) -> PortalResult<ExecutionOutcome> {
        let total = self.steps.len();
        for (index, (name, step)) in self.steps.into_iter().enumerate() {
            if self.stop.is_stopped() {
                info!(
                    step = %name,
                    skipped = total - index,
                    "⏹️ Stop indicator set, abandoning remaining steps"
                );
                return Ok(ExecutionOutcome::Cancelled { at: index });
            }

            debug!(step = %name, index = index, total = total, "▶️ Running step");
            step().await?;
        }
        Ok(ExecutionOutcome::Completed)
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("stopped", &self.stop.is_stopped())
            .field(
                "steps",
                &self.steps.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortalError;
    use parking_lot::Mutex;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let log = recorder();
        let mut executor = TaskExecutor::new(StopIndicator::new());
        for name in ["table", "objects", "foreign_keys"] {
            let log = Arc::clone(&log);
            executor.add_step(name, move || async move {
                log.lock().push(name);
                Ok(())
            });
        }

        assert_eq!(executor.execute().await.unwrap(), ExecutionOutcome::Completed);
        assert_eq!(*log.lock(), vec!["table", "objects", "foreign_keys"]);
    }

    #[tokio::test]
    async fn test_stop_abandons_remaining_steps() {
        let log = recorder();
        let stop = StopIndicator::new();
        let mut executor = TaskExecutor::new(stop.clone());

        let first_log = Arc::clone(&log);
        let first_stop = stop.clone();
        executor.add_step("first", move || async move {
            first_log.lock().push("first");
            first_stop.set();
            Ok(())
        });
        let second_log = Arc::clone(&log);
        executor.add_step("second", move || async move {
            second_log.lock().push("second");
            Ok(())
        });

        let outcome = executor.execute().await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled { at: 1 });
        assert_eq!(*log.lock(), vec!["first"]);
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_failure_propagates_without_retry() {
        let log = recorder();
        let mut executor = TaskExecutor::new(StopIndicator::new());

        let failing_log = Arc::clone(&log);
        executor.add_step("failing", move || async move {
            failing_log.lock().push("failing");
            Err(PortalError::ProcessAbnormalExit {
                name: "full migration".into(),
            })
        });
        let next_log = Arc::clone(&log);
        executor.add_step("next", move || async move {
            next_log.lock().push("next");
            Ok(())
        });

        let err = executor.execute().await.unwrap_err();
        assert!(matches!(err, PortalError::ProcessAbnormalExit { .. }));
        assert_eq!(*log.lock(), vec!["failing"]);
    }

    #[test]
    fn test_indicator_is_sticky() {
        let stop = StopIndicator::new();
        let shared = stop.clone();
        assert!(!shared.is_stopped());
        stop.set();
        stop.set();
        assert!(shared.is_stopped());
    }
}
