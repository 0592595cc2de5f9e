//! Per-phase progress readers.
//!
//! Each reader turns one engine's native artifacts into the normalized
//! records under `status/`. Readers never touch engine files; they only
//! re-parse an artifact whose timestamp moved since the previous poll.

use super::cache::ModifiedCache;
use super::models::{
    is_entry_integrity, CheckEntry, CheckFailEntry, CheckResultLine, FullSnapshot, ObjectKind,
    SinkStatus, SourceStatus, StreamProgress,
};
use super::vector::VectorProgress;
use crate::config::SourceType;
use crate::constants::{replica_orders, replicate_orders};
use crate::process::{StreamDirection, StreamSide};
use crate::state_machine::MigrationPhase;
use crate::workspace::{latest_status_file, PhaseArea, TaskWorkspace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct PhaseReaders {
    workspace: TaskWorkspace,
    source_type: SourceType,
    cache: ModifiedCache,
    vector: Option<Arc<VectorProgress>>,
}

impl PhaseReaders {
    pub fn new(workspace: TaskWorkspace, source_type: SourceType) -> Self {
        Self {
            workspace,
            source_type,
            cache: ModifiedCache::new(),
            vector: None,
        }
    }

    pub fn with_vector_progress(mut self, progress: Arc<VectorProgress>) -> Self {
        self.vector = Some(progress);
        self
    }

    pub fn read_phase(&self, phase: MigrationPhase) {
        match phase {
            MigrationPhase::FullMigration => self.read_full_migration(),
            MigrationPhase::FullDataCheck => self.read_full_data_check(),
            MigrationPhase::IncrementalMigration => self.read_stream(StreamDirection::Incremental),
            MigrationPhase::ReverseMigration => self.read_stream(StreamDirection::Reverse),
            // Progress of the background check is not published separately
            MigrationPhase::IncrementalDataCheck => {}
        }
    }

    /// Engine snapshot that reports `kind`
    fn snapshot_path(&self, kind: ObjectKind) -> Option<PathBuf> {
        match self.source_type {
            SourceType::Mysql => {
                let order = match kind {
                    ObjectKind::Table => replica_orders::INIT_REPLICA,
                    ObjectKind::View => replica_orders::START_VIEW_REPLICA,
                    ObjectKind::Function => replica_orders::START_FUNC_REPLICA,
                    ObjectKind::Trigger => replica_orders::START_TRIGGER_REPLICA,
                    ObjectKind::Procedure => replica_orders::START_PROC_REPLICA,
                };
                Some(self.workspace.full_copy_status_file(order))
            }
            SourceType::Postgresql => {
                let order = match kind {
                    ObjectKind::Table => replicate_orders::TABLE,
                    ObjectKind::View => replicate_orders::VIEW,
                    ObjectKind::Function => replicate_orders::FUNCTION,
                    ObjectKind::Trigger => replicate_orders::TRIGGER,
                    ObjectKind::Procedure => replicate_orders::PROCEDURE,
                };
                Some(self.workspace.full_engine_status_file(order))
            }
            SourceType::Milvus => None,
        }
    }

    pub fn read_full_migration(&self) {
        if let Some(vector) = &self.vector {
            vector.flush(
                &self.workspace.full_success_file(),
                &self.workspace.full_failed_file(),
            );
            return;
        }

        for kind in ObjectKind::ALL {
            let Some(path) = self.snapshot_path(kind) else {
                continue;
            };
            if !self.cache.is_modified(&path) {
                continue;
            }
            let Some(snapshot) = read_json::<FullSnapshot>(&path) else {
                continue;
            };

            if kind == ObjectKind::Table {
                if let Some(total) = &snapshot.total {
                    write_json(&self.workspace.full_total_file(), total);
                }
            }

            let entries = snapshot.entries(kind).unwrap_or_default();
            if entries.is_empty() {
                continue;
            }
            if !is_entry_integrity(entries) {
                debug!(kind = kind.kind_name(), "Snapshot still has pending entries, not publishing");
                continue;
            }
            write_json(&self.workspace.full_object_file(kind.kind_name()), &entries);
        }
    }

    pub fn read_full_data_check(&self) {
        if self.source_type != SourceType::Mysql {
            return;
        }
        let area = PhaseArea::FullDataCheck;

        let success_log = self.workspace.check_success_log(area);
        if self.cache.is_modified(&success_log) {
            if let Some(lines) = read_check_results(&success_log) {
                let entries: Vec<CheckEntry> = lines
                    .into_iter()
                    .map(|line| CheckEntry {
                        schema: line.schema,
                        name: line.table,
                    })
                    .collect();
                write_json(&self.workspace.check_success_file(area), &entries);
            }
        }

        let failed_log = self.workspace.check_failed_log(area);
        if self.cache.is_modified(&failed_log) {
            if let Some(lines) = read_check_results(&failed_log) {
                let entries: Vec<CheckFailEntry> = lines
                    .into_iter()
                    .map(|line| CheckFailEntry {
                        repair_file_path: self
                            .workspace
                            .check_repair_file(area, &line.schema, &line.table)
                            .display()
                            .to_string(),
                        schema: line.schema,
                        name: line.table,
                        error: line.message,
                    })
                    .collect();
                write_json(&self.workspace.check_failed_file(area), &entries);
            }
        }
    }

    pub fn read_stream(&self, direction: StreamDirection) {
        if self.source_type == SourceType::Milvus {
            return;
        }
        let Some(progress) = self.combine_stream(direction) else {
            return;
        };
        let target = match direction {
            StreamDirection::Incremental => self.workspace.incremental_status_file(),
            StreamDirection::Reverse => self.workspace.reverse_status_file(),
        };
        write_json(&target, &progress);
    }

    fn combine_stream(&self, direction: StreamDirection) -> Option<StreamProgress> {
        let area = direction.area();
        let dir = self.workspace.status_dir(area);
        let source_path = latest_status_file(&dir, direction.status_prefix(StreamSide::Source))?;
        let sink_path = latest_status_file(&dir, direction.status_prefix(StreamSide::Sink))?;

        let source_modified = self.cache.is_modified(&source_path);
        let sink_modified = self.cache.is_modified(&sink_path);
        if !source_modified && !sink_modified {
            return None;
        }

        let source = read_json::<SourceStatus>(&source_path)?;
        let sink = read_json::<SinkStatus>(&sink_path)?;
        let has_fail_sql = fs::read_to_string(self.workspace.fail_sql_file(area))
            .map(|contents| !contents.trim().is_empty())
            .unwrap_or(false);

        Some(StreamProgress::combine(
            &source,
            &sink,
            direction == StreamDirection::Reverse,
            has_fail_sql,
        ))
    }
}

/// Parse a JSON artifact; blank or unreadable files yield `None`
fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = fs::read_to_string(path).ok()?;
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse progress artifact");
            None
        }
    }
}

/// The checker appends `{...},` per table; wrap it into a proper array
fn read_check_results(path: &Path) -> Option<Vec<CheckResultLine>> {
    let contents = fs::read_to_string(path).ok()?;
    let body = contents.trim_end();
    if body.is_empty() {
        return None;
    }
    let body = body.strip_suffix(',').unwrap_or(body);
    match serde_json::from_str(&format!("[{body}]")) {
        Ok(lines) => Some(lines),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse data check results");
            None
        }
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(std::io::Error::from)
        .and_then(|json| fs::write(path, json));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write progress record");
    }
}
