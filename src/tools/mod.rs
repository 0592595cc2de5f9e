//! Facades over external services shared by a task's phases.

pub mod bus;
pub mod database;

pub use bus::{clean_task_topics, ensure_healthy, task_topics, KafkaBus, MessageBus, RestartPolicy};
pub use database::{DatabaseAdmin, PgDatabaseAdmin, ReplicaIdentity};
