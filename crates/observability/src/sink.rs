//! Logger sink: `log(level, message, context)`.
//!
//! Collaborators that only know about a generic logger (rather than
//! `tracing` macros) log through this trait. The default implementation
//! forwards to `tracing` under the [`AUDIT_TARGET`] target with the context
//! attached as a JSON field, so audit lines can be filtered separately
//! (`RUST_LOG=fulfillsync::audit=info`).

use std::sync::Mutex;

use serde_json::Value as JsonValue;

pub const AUDIT_TARGET: &str = "fulfillsync::audit";

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, context: &JsonValue);
}

/// Forwards to the process-wide `tracing` subscriber.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str, context: &JsonValue) {
        match level {
            LogLevel::Debug => tracing::debug!(target: AUDIT_TARGET, context = %context, "{message}"),
            LogLevel::Info => tracing::info!(target: AUDIT_TARGET, context = %context, "{message}"),
            LogLevel::Warning => tracing::warn!(target: AUDIT_TARGET, context = %context, "{message}"),
            LogLevel::Error => tracing::error!(target: AUDIT_TARGET, context = %context, "{message}"),
        }
    }
}

/// Captures log lines in memory (tests).
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(LogLevel, String, JsonValue)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(LogLevel, String, JsonValue)> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, message: &str, context: &JsonValue) {
        self.lines
            .lock()
            .unwrap()
            .push((level, message.to_string(), context.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_level_message_and_context() {
        let sink = MemorySink::new();
        sink.log(LogLevel::Warning, "quota low", &serde_json::json!({"remaining": 3}));

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, LogLevel::Warning);
        assert_eq!(lines[0].1, "quota low");
        assert_eq!(lines[0].2["remaining"], 3);
    }

    #[test]
    fn tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.log(LogLevel::Error, "boom", &JsonValue::Null);
    }
}
