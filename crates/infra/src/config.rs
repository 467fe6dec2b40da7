//! Configuration loading and representation.
//!
//! All knobs come from environment variables with defaults suitable for a
//! single worker talking to the production provider API.

use std::str::FromStr;
use std::time::Duration;

use fulfillsync_core::SyncError;

use crate::jobs::DispatcherConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for SyncError {
    fn from(err: ConfigError) -> Self {
        SyncError::configuration(err.to_string())
    }
}

/// Runtime configuration of the sync subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the versioned provider API, without trailing slash.
    pub api_base_url: String,
    /// Hard timeout for a single HTTP request.
    pub request_timeout: Duration,
    /// Inline retry budget of the API client.
    pub client_max_attempts: u32,
    /// Deferred retry budget of a queued job.
    pub queue_max_attempts: u32,
    /// Backoff of the client budget.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Backoff of the queue budget.
    pub queue_retry_base_delay: Duration,
    pub queue_retry_max_delay: Duration,
    pub dispatch_batch_size: usize,
    pub dispatch_interval: Duration,
    pub sweep_interval: Duration,
    /// Lease length of an entity lock.
    pub lock_ttl: Duration,
    /// How long terminal jobs and sync-log entries are kept.
    pub retention: Duration,
    /// Move newly created remote orders straight into production.
    pub send_to_production: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.printify.com/v1".to_string(),
            request_timeout: Duration::from_secs(30),
            client_max_attempts: 3,
            queue_max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            queue_retry_base_delay: Duration::from_secs(60),
            queue_retry_max_delay: Duration::from_secs(3600),
            dispatch_batch_size: 50,
            dispatch_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            lock_ttl: Duration::from_secs(300),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            send_to_production: false,
        }
    }
}

impl SyncConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_base_url = lookup("FULFILLMENT_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base_url);

        Ok(Self {
            api_base_url,
            request_timeout: secs(&lookup, "HTTP_TIMEOUT_SECS", defaults.request_timeout)?,
            client_max_attempts: parse(&lookup, "CLIENT_MAX_ATTEMPTS", defaults.client_max_attempts)?
                .max(1),
            queue_max_attempts: parse(&lookup, "QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts)?
                .max(1),
            retry_base_delay: parse::<u64, _>(&lookup, "RETRY_BASE_MS", 1_000)
                .map(Duration::from_millis)?,
            retry_max_delay: secs(&lookup, "RETRY_MAX_SECS", defaults.retry_max_delay)?,
            queue_retry_base_delay: secs(
                &lookup,
                "QUEUE_RETRY_BASE_SECS",
                defaults.queue_retry_base_delay,
            )?,
            queue_retry_max_delay: secs(
                &lookup,
                "QUEUE_RETRY_MAX_SECS",
                defaults.queue_retry_max_delay,
            )?,
            dispatch_batch_size: parse(&lookup, "DISPATCH_BATCH_SIZE", defaults.dispatch_batch_size)?,
            dispatch_interval: secs(&lookup, "DISPATCH_INTERVAL_SECS", defaults.dispatch_interval)?,
            sweep_interval: secs(&lookup, "SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            lock_ttl: secs(&lookup, "LOCK_TTL_SECS", defaults.lock_ttl)?,
            retention: parse::<u64, _>(&lookup, "RETENTION_DAYS", 30)
                .map(|days| Duration::from_secs(days * 24 * 60 * 60))?,
            send_to_production: parse(&lookup, "SEND_TO_PRODUCTION", defaults.send_to_production)?,
        })
    }

    /// Inline budget used by the API client.
    pub fn client_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.client_max_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }

    /// Deferred budget used by the dispatcher.
    pub fn queue_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.queue_max_attempts,
            self.queue_retry_base_delay,
            self.queue_retry_max_delay,
        )
    }

    /// Longest the API client may sleep inside one call. Kept well below the
    /// entity lease so a waiting worker never outlives its lock.
    pub fn max_inline_wait(&self) -> Duration {
        self.lock_ttl / 2
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            batch_size: self.dispatch_batch_size,
            interval: self.dispatch_interval,
            sweep_interval: self.sweep_interval,
            queue_policy: self.queue_policy(),
            stale_after: self.lock_ttl,
            retention: self.retention,
            ..DispatcherConfig::default()
        }
    }
}

fn parse<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn secs<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.dispatch_batch_size, 50);
        assert_eq!(config.max_inline_wait(), Duration::from_secs(150));
        assert!(config.max_inline_wait() < config.dispatcher_config().stale_after);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SyncConfig::from_lookup(lookup_from(&[
            ("FULFILLMENT_API_URL", "http://localhost:9000/v1/"),
            ("CLIENT_MAX_ATTEMPTS", "5"),
            ("QUEUE_MAX_ATTEMPTS", "0"),
            ("RETENTION_DAYS", "7"),
            ("SEND_TO_PRODUCTION", "true"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "http://localhost:9000/v1");
        assert_eq!(config.client_max_attempts, 5);
        assert_eq!(config.queue_max_attempts, 1);
        assert_eq!(config.retention, Duration::from_secs(7 * 24 * 60 * 60));
        assert!(config.send_to_production);
    }

    #[test]
    fn invalid_numbers_are_reported_with_their_key() {
        let err = SyncConfig::from_lookup(lookup_from(&[("LOCK_TTL_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("LOCK_TTL_SECS"));
    }

    #[test]
    fn budgets_are_independent() {
        let config = SyncConfig {
            client_max_attempts: 4,
            queue_max_attempts: 2,
            ..SyncConfig::default()
        };
        assert_eq!(config.client_policy().max_attempts, 4);
        assert_eq!(config.queue_policy().max_attempts, 2);
        assert_eq!(config.dispatcher_config().queue_policy.max_attempts, 2);
    }
}
