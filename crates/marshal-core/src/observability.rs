//! Observability infrastructure for marshal.
//!
//! Structured logging with consistent spans. This module provides the
//! initialization helper and the span constructors used by the engine so that
//! every log line emitted while a module runs carries the invocation, shard and
//! module it belongs to.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::id::InvocationId;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for lab hosts feeding a log pipeline).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at host startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `marshal_suite=debug`)
///
/// # Example
///
/// ```rust
/// use marshal_core::observability::{init_logging, LogFormat};
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

/// Creates a span covering one invocation (one shard of a suite).
///
/// # Example
///
/// ```rust
/// use marshal_core::id::InvocationId;
/// use marshal_core::observability::invocation_span;
///
/// let span = invocation_span(&InvocationId::generate(), 0, 1);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn invocation_span(invocation_id: &InvocationId, shard_index: u32, shard_count: u32) -> Span {
    tracing::info_span!(
        "invocation",
        invocation_id = %invocation_id,
        shard_index = shard_index,
        shard_count = shard_count,
    )
}

/// Creates a span for work done on behalf of one module.
#[must_use]
pub fn module_span(module: &str, serial: &str) -> Span {
    tracing::info_span!("module", module = module, serial = serial)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn module_span_can_be_entered() {
        let span = module_span("CtsExampleTestCases", "emulator-5554");
        let _guard = span.enter();
        tracing::info!("message in module span");
    }

    #[test]
    fn invocation_span_can_be_entered() {
        let span = invocation_span(&InvocationId::generate(), 1, 4);
        let _guard = span.enter();
        tracing::info!("message in invocation span");
    }
}
