//! # Structured Logging Module
//!
//! Environment-aware console logging built on `tracing-subscriber`.
//!
//! Components never hold a logger object: they emit `tracing` events with
//! structured fields (`task_id`, `connection_id`, `kind`, ...) and whoever
//! owns the process decides where those go. Tests install their own scoped
//! subscriber, production calls [`init_tracing`] once at startup.
//!
//! ## Environment Variables
//!
//! - `ERP_SYNC_ENV` / `APP_ENV`: environment name (default `development`)
//! - `LOG_LEVEL` / `RUST_LOG`: filter directive, overriding the per-environment default
//! - `ERP_SYNC_LOG_FORMAT=json`: emit one JSON object per line

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::models::{BatchReport, Connection, ConnectionId};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install the global subscriber; later calls are no-ops
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let json = use_json_format();
        let use_ansi = !json && IsTerminal::is_terminal(&std::io::stdout());

        let console_layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(console_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                log_level = %log_level,
                json_format = json,
                ansi_colors = use_ansi,
                "🔧 Structured logging initialized"
            );
        }
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("ERP_SYNC_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment variables or environment defaults
fn get_log_level(environment: &str) -> String {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        return level.to_lowercase();
    }

    if let Ok(level) = std::env::var("RUST_LOG") {
        return level.to_lowercase();
    }

    default_log_level(environment).to_string()
}

fn default_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

fn use_json_format() -> bool {
    std::env::var("ERP_SYNC_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log a task lifecycle operation with the standard field set
pub fn log_task_operation(
    operation: &str,
    task_id: Uuid,
    connection_id: ConnectionId,
    kind: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        connection_id = connection_id,
        kind = %kind,
        status = %status,
        details = details.unwrap_or(""),
        "{}",
        operation
    );
}

/// Log a connection health transition
pub fn log_connection_operation(operation: &str, connection: &Connection) {
    tracing::info!(
        operation = %operation,
        connection_id = connection.connection_id,
        erp_type = %connection.erp_type,
        health = %connection.health,
        is_active = connection.is_active,
        latency_ms = connection.last_latency_ms,
        consecutive_failures = connection.consecutive_failures,
        last_error = connection.last_error.as_deref().unwrap_or(""),
        "{}",
        operation
    );
}

/// Log bulk progress after a chunk has been persisted
pub fn log_batch_progress(task_id: Uuid, chunk: usize, report: &BatchReport) {
    tracing::info!(
        operation = crate::constants::operations::BATCH_CHUNK_PERSISTED,
        task_id = %task_id,
        chunk = chunk,
        processed = report.processed,
        total = report.total,
        succeeded = report.succeeded,
        failed = report.failed,
        skipped = report.skipped,
        "📦 Batch chunk persisted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(default_log_level("production"), "info");
        assert_eq!(default_log_level("test"), "warn");
        assert_eq!(default_log_level("development"), "debug");
        assert_eq!(default_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        assert!(TRACING_INITIALIZED.get().is_some());
    }
}
