//! Observability infrastructure for Stratum.
//!
//! Structured logging with consistent spans across agents. This module
//! provides initialization helpers and span constructors shared by the
//! queue, host, scheduler, and orchestrator.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at agent startup. Safe to call multiple times; subsequent calls
/// are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `stratum_flow=debug`)
///
/// # Example
///
/// ```rust
/// use stratum_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for job-queue operations with standard fields.
///
/// # Example
///
/// ```rust
/// use stratum_core::observability::queue_span;
///
/// let span = queue_span("dequeue", 3);
/// let _guard = span.enter();
/// // ... queue operation
/// ```
#[must_use]
pub fn queue_span(operation: &str, queue_type: u8) -> Span {
    tracing::info_span!(
        "job_queue",
        op = operation,
        queue_type = queue_type,
    )
}

/// Creates a span for orchestration operations.
///
/// # Example
///
/// ```rust
/// use stratum_core::observability::orchestration_span;
///
/// let span = orchestration_span("poll_children", 17, 4);
/// let _guard = span.enter();
/// // ... orchestration operation
/// ```
#[must_use]
pub fn orchestration_span(operation: &str, job_id: u64, trigger_sequence: u64) -> Span {
    tracing::info_span!(
        "orchestration",
        op = operation,
        job_id = job_id,
        trigger_sequence = trigger_sequence,
    )
}
