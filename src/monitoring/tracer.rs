/*!
 * Structured Tracing
 * Subscriber setup and per-command spans using the tracing crate
 *
 * Features:
 * - Env-filtered output (`RUST_LOG`, default `info`)
 * - Optional JSON formatting for log shippers
 * - Request ids attached to every command span for correlation
 */

use crate::core::types::RequestId;
use std::time::Instant;
use tracing::{debug, info, span, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - SCOPED_EXEC_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("SCOPED_EXEC_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
    };

    if installed.is_ok() {
        info!(json = use_json, "Structured tracing initialized");
    }
}

/// Span covering one submitted command, across all of its attempts
pub struct CommandSpan {
    span: tracing::Span,
    start: Instant,
    request_id: RequestId,
}

impl CommandSpan {
    pub fn new(command: &str, request_id: RequestId) -> Self {
        let span = span!(
            Level::INFO,
            "command",
            request_id = %request_id,
            command = command,
            attempts = tracing::field::Empty,
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            request_id,
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn record_attempts(&self, attempts: u32) {
        self.span.record("attempts", attempts);
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.span.record("outcome", outcome);
    }
}

impl Drop for CommandSpan {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.span.record("duration_ms", elapsed.as_millis() as u64);
        let _entered = self.span.enter();
        debug!(
            request_id = %self.request_id,
            duration_ms = elapsed.as_millis() as u64,
            "command span closed"
        );
    }
}
