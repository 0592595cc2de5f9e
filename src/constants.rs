//! # Portal Constants
//!
//! File names, engine sub-commands and log sentinels shared by the process
//! adapters, the progress readers and the task workspace layout.

/// Normalized and engine-native file names under the task workspace
pub mod files {
    pub const MIGRATION_STATUS: &str = "migration-status.txt";
    pub const HEARTBEAT: &str = "heartbeat";

    pub const FULL_TOTAL: &str = "total.txt";
    pub const FULL_ENGINE_DIR: &str = "engine";
    pub const FULL_MIGRATION_LOG: &str = "full_migration.log";

    pub const SUCCESS_LIST: &str = "success.txt";
    pub const FAILED_LIST: &str = "failed.txt";

    pub const CHECK_RESULT_DIR: &str = "result";
    pub const CHECK_SUCCESS_LOG: &str = "success.log";
    pub const CHECK_FAILED_LOG: &str = "failed.log";
    pub const CHECK_SIGN_FILE: &str = "process.pid";

    pub const INCREMENTAL_STATUS: &str = "incremental.txt";
    pub const REVERSE_STATUS: &str = "reverse.txt";
    pub const FAIL_SQL: &str = "fail-sql.txt";
}

/// Name prefixes of the stream connector status snapshots
pub mod status_prefixes {
    pub const FORWARD_SOURCE: &str = "forward-source-process";
    pub const FORWARD_SINK: &str = "forward-sink-process";
    pub const REVERSE_SOURCE: &str = "reverse-source-process";
    pub const REVERSE_SINK: &str = "reverse-sink-process";
}

/// Sub-commands of the replica-style full copy engine
pub mod replica_orders {
    pub const DROP_REPLICA_SCHEMA: &str = "drop_replica_schema";
    pub const CREATE_REPLICA_SCHEMA: &str = "create_replica_schema";
    pub const ADD_SOURCE: &str = "add_source";
    pub const INIT_REPLICA: &str = "init_replica";
    pub const START_TRIGGER_REPLICA: &str = "start_trigger_replica";
    pub const START_VIEW_REPLICA: &str = "start_view_replica";
    pub const START_FUNC_REPLICA: &str = "start_func_replica";
    pub const START_PROC_REPLICA: &str = "start_proc_replica";
    pub const DETACH_REPLICA: &str = "detach_replica";

    /// Orders that need the `--source` argument
    pub const NEED_SOURCE: [&str; 7] = [
        ADD_SOURCE,
        INIT_REPLICA,
        START_TRIGGER_REPLICA,
        START_VIEW_REPLICA,
        START_FUNC_REPLICA,
        START_PROC_REPLICA,
        DETACH_REPLICA,
    ];

    /// Piped to stdin by the destructive detach order
    pub const DETACH_CONFIRMATION: &str = "YES";
}

/// Sub-commands of the replicate-style full copy engine
pub mod replicate_orders {
    pub const DROP_REPLICA_SCHEMA: &str = "drop_replica_schema";
    pub const TABLE: &str = "table";
    pub const SEQUENCE: &str = "sequence";
    pub const PRIMARY_KEY: &str = "primarykey";
    pub const INDEX: &str = "index";
    pub const CONSTRAINT: &str = "constraint";
    pub const VIEW: &str = "view";
    pub const FUNCTION: &str = "function";
    pub const TRIGGER: &str = "trigger";
    pub const PROCEDURE: &str = "procedure";
    pub const FOREIGN_KEY: &str = "foreignkey";
}

/// Log and sign-file markers that distinguish clean completion from a crash
pub mod sentinels {
    pub const REPLICATE_DROP_SCHEMA: &str = "drop replica schema(sch_debezium) success.";
    pub const REPLICATE_ORDER_SUFFIX: &str = " migration complete. full report thread is close.";
    pub const REPLICA_ORDER_SUFFIX: &str = " finished";

    pub const CHECK_SOURCE_STOP: &str = "\"endpoint\":\"SOURCE\",\"event\":\"stop\"";
    pub const CHECK_SINK_STOP: &str = "\"endpoint\":\"SINK\",\"event\":\"stop\"";
    pub const CHECK_CHECK_STOP: &str = "\"endpoint\":\"CHECK\",\"event\":\"stop\"";

    pub const COLLECTION_END: &str = "Migration end.";
    pub const COLLECTION_SUCCESS: &str = "Migration completed in";
    pub const COLLECTION_FAILED: &str = "Migration failed";

    /// Replica-style engines mark each order's end with `<order> finished`
    pub fn replica_order(order: &str) -> String {
        format!("{order}{REPLICA_ORDER_SUFFIX}")
    }

    pub fn replicate_order(order: &str) -> String {
        if order == super::replicate_orders::DROP_REPLICA_SCHEMA {
            REPLICATE_DROP_SCHEMA.to_string()
        } else {
            format!("{order}{REPLICATE_ORDER_SUFFIX}")
        }
    }
}

/// Logical replication objects used by reverse migration
pub mod replication {
    pub const PUBLICATION_NAME: &str = "dbz_publication";
    pub const SLOT_PLUGIN: &str = "pgoutput";
    pub const SLOT_PREFIX: &str = "reverse_slot";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert_eq!(
            sentinels::replica_order(replica_orders::INIT_REPLICA),
            "init_replica finished"
        );
        assert_eq!(
            sentinels::replicate_order(replicate_orders::TABLE),
            "table migration complete. full report thread is close."
        );
        assert_eq!(
            sentinels::replicate_order(replicate_orders::DROP_REPLICA_SCHEMA),
            "drop replica schema(sch_debezium) success."
        );
    }
}
