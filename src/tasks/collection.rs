//! Full migration of vector collections.
//!
//! Each collection is one short-lived engine run. Runs are bounded by the
//! configured concurrency and their outcomes feed [`VectorProgress`].

use super::{clear_history, TaskContext};
use crate::constants::sentinels;
use crate::error::PortalResult;
use crate::process::{Supervised, TaskProcess};
use crate::progress::VectorProgress;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug)]
pub struct CollectionTask {
    ctx: TaskContext,
    collections: Vec<String>,
    concurrency: usize,
    progress: Arc<VectorProgress>,
    running: Mutex<Vec<Arc<TaskProcess>>>,
}

impl CollectionTask {
    pub fn new(
        ctx: TaskContext,
        collections: Vec<String>,
        concurrency: usize,
        progress: Arc<VectorProgress>,
    ) -> Self {
        Self {
            ctx,
            collections,
            concurrency,
            progress,
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub async fn before_task(&self) -> PortalResult<()> {
        clear_history("collection migration", &self.ctx.workspace().tmp_dir());
        Ok(())
    }

    /// Migrate every collection; individual failures are recorded, not raised
    pub async fn migrate_all(&self) -> PortalResult<()> {
        if self.collections.is_empty() {
            info!("No collections to migrate");
            return Ok(());
        }

        let limit = self.concurrency.max(1).min(self.collections.len());
        info!(
            collections = self.collections.len(),
            concurrency = limit,
            "📦 Starting collection migration"
        );

        let outcomes: Vec<bool> = stream::iter(self.collections.clone())
            .map(|collection| async move { self.migrate_one(&collection).await })
            .buffer_unordered(limit)
            .collect()
            .await;

        let completed = outcomes.iter().filter(|ok| **ok).count();
        info!(
            completed = completed,
            total = self.collections.len(),
            "Collection migration finished: {}/{} collections",
            completed,
            self.collections.len()
        );
        Ok(())
    }

    async fn migrate_one(&self, collection: &str) -> bool {
        if self.ctx.stop.is_stopped() {
            debug!(collection = %collection, "Task stopping, skipping collection");
            return false;
        }

        let process = Arc::new(
            self.ctx
                .factory
                .collection_copy(collection)
                .with_stop_indicator(self.ctx.stop.clone()),
        );
        self.running.lock().push(Arc::clone(&process));

        let succeeded = match self.run(&process).await {
            Ok(normal) => normal && self.log_reports_success(collection),
            Err(e) => {
                error!(collection = %collection, error = %e, "Failed to migrate collection");
                false
            }
        };

        self.running.lock().retain(|p| !Arc::ptr_eq(p, &process));
        if succeeded {
            self.progress.add_completed(collection);
        } else {
            self.progress.add_failed(collection);
        }
        succeeded
    }

    async fn run(&self, process: &TaskProcess) -> PortalResult<bool> {
        process.start().await?;
        process.wait_exit().await?;
        Ok(process.check_status().await)
    }

    fn log_reports_success(&self, collection: &str) -> bool {
        let log = self.ctx.workspace().collection_log(collection);
        match fs::read_to_string(&log) {
            Ok(contents) => {
                contents.contains(sentinels::COLLECTION_SUCCESS)
                    && !contents.contains(sentinels::COLLECTION_FAILED)
            }
            Err(e) => {
                error!(collection = %collection, log = %log.display(), error = %e, "Failed to read collection log");
                false
            }
        }
    }

    pub async fn stop(&self) {
        let running: Vec<_> = self.running.lock().clone();
        for process in running {
            process.stop().await;
        }
    }

    pub async fn after_task(&self) {
        clear_history("collection migration", &self.ctx.workspace().tmp_dir());
    }
}
