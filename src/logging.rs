//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and a JSON log file,
//! plus helpers that give phase, process and cleanup events a uniform shape.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging into `PORTAL_LOG_DIR` (default `log`)
pub fn init_structured_logging() {
    let log_dir = std::env::var("PORTAL_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("log"));
    init_structured_logging_in(&log_dir);
}

/// Initialize structured logging with the JSON file layer under `log_dir`.
///
/// Only the first call has any effect. If the directory cannot be created
/// logging falls back to the console layer alone.
pub fn init_structured_logging_in(log_dir: &Path) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(filter());

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");

        if let Err(e) = fs::create_dir_all(log_dir) {
            let _ = tracing_subscriber::registry().with(console).try_init();
            tracing::warn!(
                log_dir = %log_dir.display(),
                error = %e,
                "Cannot create log directory, logging to console only"
            );
            return;
        }

        let file_appender = tracing_appender::rolling::never(log_dir, &log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry().with(console).with(
            fmt::layer()
                .with_writer(file_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(filter()),
        );

        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_dir.join(&log_filename).display(),
            "🔧 STRUCTURED LOGGING: Initialized with file output"
        );

        // The writer must outlive the process
        std::mem::forget(guard);
    });
}

/// Get current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("PORTAL_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a phase-level operation (start, stop, resume, restart)
pub fn log_phase_operation(
    operation: &str,
    task_id: &str,
    phase: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        phase = %phase,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🚦 PHASE_OPERATION"
    );
}

/// Log a supervised process event
pub fn log_process_operation(operation: &str, process: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        process = %process,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "⚙️ PROCESS_OPERATION"
    );
}

/// Log a cleanup step that failed and was skipped
pub fn log_cleanup_failure(component: &str, operation: &str, error: &dyn std::fmt::Display) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        timestamp = %Utc::now().to_rfc3339(),
        "🧹 CLEANUP_FAILED"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("PORTAL_ENV", "test_override");
        let env = get_environment();
        assert_eq!(env, "test_override");
        std::env::remove_var("PORTAL_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        init_structured_logging_in(dir.path());
        init_structured_logging_in(dir.path());
        log_process_operation("stop", "full migration", "stopped", None);
    }
}
