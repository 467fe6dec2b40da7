//! Tracing and logging setup shared by every fulfillsync binary.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Logger-sink collaborator backed by `tracing`.
pub mod sink;

pub use sink::{AUDIT_TARGET, LogLevel, LogSink, MemorySink, TracingSink};
