//! # Status Report
//!
//! Operator-facing rendering of a task's progress, built only from the
//! normalized records under `status/`. The report never needs a running
//! controller, so `status` keeps working after the controller exits.

use crate::config::SourceType;
use crate::error::PortalResult;
use crate::progress::{CheckEntry, CheckFailEntry, FullEntry, FullTotalInfo, ObjectKind, StreamProgress};
use crate::state_machine::{MigrationStatus, StatusMonitor};
use crate::workspace::{PhaseArea, TaskWorkspace};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Result of the full data check for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Success,
    Failed { message: String, repair_file: String },
}

/// One row of the detailed report
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStatus {
    pub schema: String,
    pub name: String,
    pub kind: &'static str,
    pub status: i32,
    pub percent: f64,
    pub error: Option<String>,
    pub check: Option<CheckOutcome>,
}

impl ObjectStatus {
    fn from_entry(entry: FullEntry, kind: &'static str) -> Self {
        Self {
            schema: entry.schema,
            name: entry.name,
            kind,
            status: entry.status,
            percent: entry.percent,
            error: entry.error,
            check: None,
        }
    }
}

/// Label of a full copy engine object status code
pub fn object_status_label(status: i32) -> &'static str {
    match status {
        0 | 1 => "pending",
        2 => "migrating",
        3..=5 => "completed",
        6 | 7 => "failed",
        _ => "unknown",
    }
}

#[derive(Debug)]
pub struct StatusReport {
    workspace: TaskWorkspace,
    source_type: SourceType,
}

impl StatusReport {
    pub fn new(workspace: TaskWorkspace, source_type: SourceType) -> Self {
        Self {
            workspace,
            source_type,
        }
    }

    /// Render the summary, followed by the per-object list when `detail` is set
    pub fn render(&self, detail: bool) -> PortalResult<String> {
        let monitor = StatusMonitor::load(self.workspace.migration_status_file())?;
        let history: Vec<MigrationStatus> = monitor.history().into_iter().map(|r| r.status).collect();
        let seen = |pred: fn(&MigrationStatus) -> bool| history.iter().any(pred);

        let mut out = String::from("=== Data Migration Progress ===\n");
        let _ = writeln!(
            out,
            "Current migration status: {}",
            monitor.current_status().description()
        );

        if seen(MigrationStatus::is_full_migration) {
            self.append_full(&mut out);
        }
        if seen(MigrationStatus::is_full_data_check) {
            self.append_check(&mut out);
        }
        if seen(MigrationStatus::is_incremental) {
            append_stream(&mut out, "Incremental Migration", &self.workspace.incremental_status_file());
        }
        if seen(MigrationStatus::is_reverse) {
            append_stream(&mut out, "Reverse Migration", &self.workspace.reverse_status_file());
        }

        if detail {
            if seen(MigrationStatus::is_full_migration) {
                self.append_detail(&mut out);
            } else {
                out.push_str("\nNo detail migration status found\n");
            }
        }
        Ok(out)
    }

    fn append_full(&self, out: &mut String) {
        out.push_str("\n[Full Migration]\n");

        if self.source_type == SourceType::Milvus {
            let _ = writeln!(out, "Success migration objects: {}", self.vector_success().len());
            let _ = writeln!(out, "Failed migration objects: {}", self.vector_failed().len());
            return;
        }

        let total: FullTotalInfo = read_json(&self.workspace.full_total_file()).unwrap_or_default();
        let data = if total.data.is_empty() { "0" } else { total.data.as_str() };
        let speed = if total.speed.is_empty() { "0" } else { total.speed.as_str() };
        let _ = writeln!(out, "Total migration data: {data} MB");
        let _ = writeln!(out, "Total migration records: {}", total.record);
        let _ = writeln!(out, "Migration speed: {speed} MB/s");
        let _ = writeln!(
            out,
            "Migration duration: {}:{}:{}",
            total.time / 3600,
            (total.time % 3600) / 60,
            total.time % 60
        );
    }

    fn append_check(&self, out: &mut String) {
        out.push_str("\n[Full Data Check]\n");
        let success = self.check_success().len();
        let failed = self.check_failed().len();
        let _ = writeln!(out, "Total check tables: {}", success + failed);
        let _ = writeln!(out, "Success check tables: {success}");
        let _ = writeln!(out, "Failed check tables: {failed}");
    }

    fn append_detail(&self, out: &mut String) {
        out.push_str("\n[Objects]\n");

        if self.source_type == SourceType::Milvus {
            for name in self.vector_success() {
                let _ = writeln!(out, "{name}\tsuccess");
            }
            for name in self.vector_failed() {
                let _ = writeln!(out, "{name}\tfail");
            }
            return;
        }

        let objects = self.object_statuses();
        if objects.is_empty() {
            out.push_str("No detail migration status found\n");
            return;
        }
        out.push_str("schema\tname\ttype\tstatus\tpercent\terror\tcheck\tcheck message\trepair file\n");
        for object in objects {
            let (check, message, repair) = match &object.check {
                None => ("", "", ""),
                Some(CheckOutcome::Success) => ("success", "", ""),
                Some(CheckOutcome::Failed { message, repair_file }) => {
                    ("fail", message.as_str(), repair_file.as_str())
                }
            };
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}\t{:.2}\t{}\t{}\t{}\t{}",
                object.schema,
                object.name,
                object.kind,
                object_status_label(object.status),
                object.percent,
                object.error.as_deref().unwrap_or(""),
                check,
                message,
                repair
            );
        }
    }

    /// Every migrated object, tables first with their check results merged
    /// in by `schema.name`, then the other kinds in publication order
    pub fn object_statuses(&self) -> Vec<ObjectStatus> {
        let tables = self.full_entries(ObjectKind::Table);
        if tables.is_empty() {
            return Vec::new();
        }

        let mut by_name: HashMap<String, ObjectStatus> = tables
            .into_iter()
            .map(|entry| (entry.qualified_name(), ObjectStatus::from_entry(entry, "table")))
            .collect();

        for entry in self.check_success() {
            if let Some(object) = by_name.get_mut(&format!("{}.{}", entry.schema, entry.name)) {
                object.check = Some(CheckOutcome::Success);
            }
        }
        for entry in self.check_failed() {
            if let Some(object) = by_name.get_mut(&format!("{}.{}", entry.schema, entry.name)) {
                object.check = Some(CheckOutcome::Failed {
                    message: entry.error,
                    repair_file: entry.repair_file_path,
                });
            }
        }

        let mut objects: Vec<ObjectStatus> = by_name.into_values().collect();
        objects.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));

        for kind in ObjectKind::ALL.into_iter().filter(|k| *k != ObjectKind::Table) {
            let mut entries = self.full_entries(kind);
            entries.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
            objects.extend(
                entries
                    .into_iter()
                    .map(|entry| ObjectStatus::from_entry(entry, kind.kind_name())),
            );
        }
        objects
    }

    fn full_entries(&self, kind: ObjectKind) -> Vec<FullEntry> {
        read_json(&self.workspace.full_object_file(kind.kind_name())).unwrap_or_default()
    }

    fn check_success(&self) -> Vec<CheckEntry> {
        read_json(&self.workspace.check_success_file(PhaseArea::FullDataCheck)).unwrap_or_default()
    }

    fn check_failed(&self) -> Vec<CheckFailEntry> {
        read_json(&self.workspace.check_failed_file(PhaseArea::FullDataCheck)).unwrap_or_default()
    }

    fn vector_success(&self) -> Vec<String> {
        read_lines(&self.workspace.full_success_file())
    }

    fn vector_failed(&self) -> Vec<String> {
        read_lines(&self.workspace.full_failed_file())
    }
}

fn append_stream(out: &mut String, title: &str, path: &Path) {
    let progress: StreamProgress = read_json(path).unwrap_or_default();
    let _ = writeln!(out, "\n[{title}]");
    let _ = writeln!(out, "Total migration records: {}", progress.count);
    let _ = writeln!(out, "Success records: {}", progress.success_count);
    let _ = writeln!(out, "Failed records: {}", progress.fail_count);
    let _ = writeln!(out, "Skipped records: {}", progress.skipped_count);
    let _ = writeln!(out, "Remaining records: {}", progress.rest);
    let _ = writeln!(out, "Migration speed: {} records/s", progress.sink_speed);
}

/// Normalized record at `path`; `None` when absent or unreadable
fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable progress record");
            None
        }
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|contents| {
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
