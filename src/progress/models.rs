//! Engine-native progress formats and the normalized records published
//! under `status/`.

use serde::{Deserialize, Serialize};

/// Progress of one migrated object as reported by a full copy engine.
///
/// `status` is 0 while the object is still pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullEntry {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FullEntry {
    pub fn is_pending(&self) -> bool {
        self.status == 0
    }

    /// Key used to join full copy entries with check results
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Aggregate counters of the table copy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullTotalInfo {
    pub record: i64,
    pub data: String,
    pub time: i64,
    pub speed: String,
}

/// One snapshot file of a full copy engine, keyed by object kind
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FullSnapshot {
    pub total: Option<FullTotalInfo>,
    pub table: Option<Vec<FullEntry>>,
    pub view: Option<Vec<FullEntry>>,
    pub function: Option<Vec<FullEntry>>,
    pub trigger: Option<Vec<FullEntry>>,
    pub procedure: Option<Vec<FullEntry>>,
}

/// Object kinds reported by full copy engines, in publication order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Table,
    View,
    Function,
    Trigger,
    Procedure,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        Self::Table,
        Self::View,
        Self::Function,
        Self::Trigger,
        Self::Procedure,
    ];

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::View => "view",
            Self::Function => "function",
            Self::Trigger => "trigger",
            Self::Procedure => "procedure",
        }
    }
}

impl FullSnapshot {
    pub fn entries(&self, kind: ObjectKind) -> Option<&[FullEntry]> {
        match kind {
            ObjectKind::Table => self.table.as_deref(),
            ObjectKind::View => self.view.as_deref(),
            ObjectKind::Function => self.function.as_deref(),
            ObjectKind::Trigger => self.trigger.as_deref(),
            ObjectKind::Procedure => self.procedure.as_deref(),
        }
    }
}

/// A list is publishable once no entry is pending and every entry is named.
/// An empty list is trivially complete.
pub fn is_entry_integrity(entries: &[FullEntry]) -> bool {
    entries
        .iter()
        .all(|entry| !entry.is_pending() && !entry.name.trim().is_empty())
}

/// Source-side snapshot of a stream connector
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceStatus {
    pub timestamp: i64,
    pub create_count: i64,
    pub skipped_exclude_count: i64,
    pub convert_count: i64,
    pub poll_count: i64,
    pub speed: i64,
    pub rest: i64,
}

/// Sink-side snapshot of a stream connector
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SinkStatus {
    pub timestamp: i64,
    pub extract_count: i64,
    pub skipped_exclude_event_count: i64,
    pub skipped_count: i64,
    pub replayed_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub speed: i64,
    pub rest: i64,
    pub overall_pipe: i64,
}

/// Combined record of one stream direction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamProgress {
    pub count: i64,
    pub replayed_count: i64,
    pub skipped_count: i64,
    pub success_count: i64,
    pub fail_count: i64,
    pub rest: i64,
    pub source_speed: i64,
    pub sink_speed: i64,
    pub has_fail_sql: bool,
}

impl StreamProgress {
    /// Combine both sides. Reverse streams count skips on the source side.
    pub fn combine(source: &SourceStatus, sink: &SinkStatus, reverse: bool, has_fail_sql: bool) -> Self {
        let skipped_count = if reverse {
            source.skipped_exclude_count
        } else {
            sink.skipped_count + sink.skipped_exclude_event_count
        };
        Self {
            count: sink.replayed_count + sink.overall_pipe,
            replayed_count: sink.replayed_count,
            skipped_count,
            success_count: sink.success_count,
            fail_count: sink.fail_count,
            rest: sink.overall_pipe,
            source_speed: source.speed,
            sink_speed: sink.speed,
            has_fail_sql,
        }
    }
}

/// Table the consistency checker found identical on both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEntry {
    pub schema: String,
    pub name: String,
}

/// Table the consistency checker found diverging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFailEntry {
    pub schema: String,
    pub name: String,
    pub error: String,
    pub repair_file_path: String,
}

/// Raw result line written by the consistency checker
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct CheckResultLine {
    pub schema: String,
    pub table: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(name: &str, status: i32) -> FullEntry {
        FullEntry {
            schema: "public".into(),
            name: name.into(),
            status,
            percent: 1.0,
            error: None,
        }
    }

    #[test]
    fn test_snapshot_parses_partial_documents() {
        let snapshot: FullSnapshot = serde_json::from_str(
            r#"{"total":{"record":3,"data":"1MB","time":2,"speed":"0.5MB/s"},
                "table":[{"name":"t1","status":3,"percent":1.0}]}"#,
        )
        .unwrap();
        assert_eq!(snapshot.total.as_ref().map(|t| t.record), Some(3));
        let tables = snapshot.entries(ObjectKind::Table).unwrap();
        assert_eq!(tables[0].schema, "");
        assert!(snapshot.entries(ObjectKind::View).is_none());
    }

    #[test]
    fn test_combine_forward_and_reverse() {
        let source = SourceStatus {
            skipped_exclude_count: 4,
            speed: 30,
            ..SourceStatus::default()
        };
        let sink = SinkStatus {
            replayed_count: 100,
            overall_pipe: 5,
            skipped_count: 1,
            skipped_exclude_event_count: 2,
            speed: 25,
            ..SinkStatus::default()
        };

        let forward = StreamProgress::combine(&source, &sink, false, false);
        assert_eq!(forward.count, 105);
        assert_eq!(forward.rest, 5);
        assert_eq!(forward.skipped_count, 3);
        assert_eq!((forward.source_speed, forward.sink_speed), (30, 25));

        let reverse = StreamProgress::combine(&source, &sink, true, true);
        assert_eq!(reverse.skipped_count, 4);
        assert!(reverse.has_fail_sql);
    }

    #[test]
    fn test_stream_progress_uses_camel_case() {
        let json = serde_json::to_value(StreamProgress::default()).unwrap();
        assert!(json.get("hasFailSql").is_some());
        assert!(json.get("sourceSpeed").is_some());
    }

    #[test]
    fn test_blank_name_breaks_integrity() {
        assert!(is_entry_integrity(&[]));
        assert!(is_entry_integrity(&[entry("t1", 3), entry("t2", 6)]));
        assert!(!is_entry_integrity(&[entry("t1", 3), entry("  ", 3)]));
    }

    proptest! {
        #[test]
        fn prop_any_pending_entry_blocks_publication(
            statuses in proptest::collection::vec(0i32..7, 1..20)
        ) {
            let entries: Vec<_> = statuses
                .iter()
                .enumerate()
                .map(|(i, status)| entry(&format!("t{i}"), *status))
                .collect();
            let expected = statuses.iter().all(|status| *status != 0);
            prop_assert_eq!(is_entry_integrity(&entries), expected);
        }
    }
}
