#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Migration Portal
//!
//! Controller for database migration tasks. A task moves data from a source
//! database to the target in up to five phases: full migration, full data
//! check, incremental migration with its background check, and reverse
//! migration back to the source during cut-over.
//!
//! ## Architecture
//!
//! The portal never moves data itself. Every phase is carried out by
//! external engines that the portal launches, supervises and tears down:
//! a full copy engine, consistency checkers, and a pair of change-stream
//! connectors talking through a message bus. The portal sequences them,
//! prepares and releases external state (replication slots, publications,
//! bus topics, kernel parameters) and publishes normalized progress.
//!
//! ## Module Organization
//!
//! - [`state_machine`] - Migration statuses, phases and operator transition guards
//! - [`process`] - Process supervision, per-engine adapters and the process monitor
//! - [`executor`] - Ordered, cancellable step execution
//! - [`progress`] - Progress monitor normalizing engine status artifacts
//! - [`tasks`] - Phase tasks composed by a job
//! - [`job`] - The migration job and operator phase commands
//! - [`manager`] - Task lifecycle: start, stop, failure handling
//! - [`tools`] - Message bus and database administration facades
//! - [`config`] - YAML configuration and migration modes
//! - [`workspace`] - On-disk layout of one task
//! - [`report`] - Operator status report
//! - [`control`] - Local command channel to a running task
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use migration_portal::config::ConfigManager;
//! use migration_portal::manager::MigrationManager;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?.config().clone();
//! let manager = MigrationManager::connect(Arc::new(config))?;
//! manager.start().await?;
//! println!("{}", manager.status(false)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! External boundaries are traits with in-memory fakes in [`test_helpers`]:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod control;
pub mod error;
pub mod executor;
pub mod job;
pub mod logging;
pub mod manager;
pub mod process;
pub mod progress;
pub mod report;
pub mod state_machine;
pub mod tasks;
pub mod test_helpers;
pub mod tools;
pub mod workspace;

pub use config::{ConfigManager, MigrationMode, ModeManager, PortalConfig, SourceType};
pub use error::{PortalError, PortalResult};
pub use executor::{ExecutionOutcome, StopIndicator, TaskExecutor};
pub use job::MigrationJob;
pub use manager::{ManagerServices, MigrationManager};
pub use state_machine::{
    MigrationPhase, MigrationStatus, OperatorCommand, PhaseOperation, StatusMonitor,
    TransitionDecision,
};
pub use workspace::TaskWorkspace;
