//! Logging initialization and span helpers.
//!
//! Structured logging goes through `tracing`; binaries install a subscriber
//! once at startup with [`init_logging`].

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `spool_flow=debug`)
///
/// # Example
///
/// ```rust
/// use spool_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber installed elsewhere (tests, embedding apps) wins.
        let _ = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init(),
        };
    });
}

/// Creates a span for work on a single task.
///
/// # Example
///
/// ```rust
/// use spool_core::observability::task_span;
///
/// let span = task_span("drive", "01HZX3Q5V1N2", "worker-1");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn task_span(operation: &str, task_id: &str, worker_id: &str) -> Span {
    tracing::info_span!("task", op = operation, task_id = task_id, worker = worker_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn task_span_can_be_entered() {
        let span = task_span("drive", "task", "worker");
        let _guard = span.enter();
        tracing::info!("inside task span");
    }
}
