//! # Test Helpers
//!
//! In-memory stand-ins for the external boundaries of a migration task:
//! the OS process table, the message bus and the target database. Used by
//! unit tests and the integration suites under `tests/`.

pub mod bus;
pub mod database;
pub mod fixtures;
pub mod process_table;

pub use bus::FakeBus;
pub use database::FakeDatabaseAdmin;
pub use fixtures::TaskFixture;
pub use process_table::FakeProcessTable;
