//! # Phase Tasks
//!
//! One task per enabled phase. Each task owns the engines of its phase and
//! exposes the same capability: prepare, start, stop and clean up. The job
//! composes tasks; tasks never look at the migration status.
//!
//! - [`FullMigrationTask`]: full copy through an ordered-command engine, or
//!   per-collection copies for vector sources
//! - [`CheckTask`]: the three data checker roles for the full or incremental check
//! - [`StreamTask`]: a source/sink connector pair for incremental or reverse replication

pub mod check;
pub mod collection;
pub mod full;
pub mod stream;

pub use check::CheckTask;
pub use collection::CollectionTask;
pub use full::{FullCopyTask, FullMigrationTask};
pub use stream::{ReplicationObjects, StreamTask};

use crate::error::PortalResult;
use crate::executor::StopIndicator;
use crate::process::adapters::ProcessFactory;
use crate::process::ProcessMonitor;
use crate::tools::MessageBus;
use crate::workspace::TaskWorkspace;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Shared collaborators handed to every task of one job
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub factory: ProcessFactory,
    pub stop: StopIndicator,
    pub bus: Arc<dyn MessageBus>,
    pub monitor: Arc<ProcessMonitor>,
}

impl TaskContext {
    pub fn workspace(&self) -> &TaskWorkspace {
        self.factory.workspace()
    }
}

/// Lifecycle every phase task supports
#[async_trait]
pub trait PhaseTask: Send + Sync {
    fn name(&self) -> &str;

    /// Clear history and prepare external state
    async fn before_task(&self) -> PortalResult<()>;

    async fn start(&self) -> PortalResult<()>;

    /// Stop every engine of the phase; never fails
    async fn stop(&self);

    /// Release external state; failures are logged only
    async fn after_task(&self);
}

/// Empty `dir`, logging instead of failing
pub(crate) fn clear_history(task: &str, dir: &Path) {
    if let Err(e) = TaskWorkspace::clear_dir(dir) {
        warn!(task = %task, dir = %dir.display(), error = %e, "Failed to clear history files");
    }
}
