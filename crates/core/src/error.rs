//! Sync error taxonomy.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type used by job handlers and orchestrators.
pub type SyncResult<T> = Result<T, SyncError>;

/// Classified failure of a sync operation.
///
/// Every job handler converts whatever went wrong into exactly one of these
/// kinds before returning; the kind decides what the dispatcher does next.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network fault, 5xx or 429. Retried with backoff up to the queue budget.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Provider quota exhausted until `until`. Transient, but the next
    /// attempt must not start before the reset.
    #[error("rate limited until {until}: {message}")]
    Throttled {
        message: String,
        until: DateTime<Utc>,
    },

    /// Other 4xx or a failed precondition. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Missing credential or shop id. Fails before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Webhook signature rejected. Never enters the queue.
    #[error("signature rejected: {0}")]
    Signature(String),
}

/// Discriminant of [`SyncError`], handy for logging and stats.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Configuration,
    Signature,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Signature => "signature",
        }
    }
}

impl SyncError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn throttled(msg: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self::Throttled {
            message: msg.into(),
            until,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }

    /// Classify an error nothing upstream knew how to classify.
    ///
    /// Defaults to `Transient` and logs at error level so the failure is not
    /// silently absorbed by the retry budget.
    pub fn unclassified(context: &str, err: impl core::fmt::Display) -> Self {
        tracing::error!(context, error = %err, "unclassified sync failure, treating as transient");
        Self::Transient(format!("{context}: {err}"))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) | SyncError::Throttled { .. } => ErrorKind::Transient,
            SyncError::Permanent(_) => ErrorKind::Permanent,
            SyncError::Configuration(_) => ErrorKind::Configuration,
            SyncError::Signature(_) => ErrorKind::Signature,
        }
    }

    /// Only transient failures go back to the queue for another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Earliest time another attempt may start, when the provider said so.
    pub fn retry_not_before(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncError::Throttled { until, .. } => Some(*until),
            _ => None,
        }
    }

    /// The bare message, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            SyncError::Transient(m)
            | SyncError::Permanent(m)
            | SyncError::Configuration(m)
            | SyncError::Signature(m)
            | SyncError::Throttled { message: m, .. } => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(SyncError::transient("502").is_retryable());
        assert!(!SyncError::permanent("422").is_retryable());
        assert!(!SyncError::configuration("no token").is_retryable());
        assert!(!SyncError::signature("bad mac").is_retryable());
    }

    #[test]
    fn throttled_is_transient_with_a_reset() {
        let until = DateTime::<Utc>::from_timestamp(1_700_000_900, 0).unwrap();
        let err = SyncError::throttled("create order: HTTP 429", until);
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
        assert_eq!(err.retry_not_before(), Some(until));
        assert_eq!(err.message(), "create order: HTTP 429");
        assert_eq!(SyncError::transient("502").retry_not_before(), None);
    }

    #[test]
    fn unclassified_defaults_to_transient() {
        let err = SyncError::unclassified("decode snapshot", "unexpected eof");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.message(), "decode snapshot: unexpected eof");
    }
}
