//! Retry policy and the retry state machine.
//!
//! The policy is pure: it decides *whether* a failure is worth another
//! attempt and *how long* to wait. The same policy type is used twice with
//! independent budgets: inline by the API client (fast retries inside one
//! call) and by the dispatcher (deferred retries via job reschedule).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
///
/// `max_attempts` counts every attempt including the first one, so a policy
/// with `max_attempts = 3` makes at most three calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Why an attempt failed, as far as retry eligibility is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The provider answered with a non-success status.
    Status {
        code: u16,
        /// Provider-supplied time at which the quota resets, when the
        /// response was rate limited or reported an exhausted quota.
        rate_limit_reset: Option<DateTime<Utc>>,
    },
    /// Connection refused, reset, DNS failure, body read error.
    Network(String),
    /// The hard per-request timeout elapsed.
    Timeout,
}

impl Failure {
    pub fn status(code: u16) -> Self {
        Self::Status {
            code,
            rate_limit_reset: None,
        }
    }

    /// 5xx, 429 and network faults are retryable; other 4xx never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Failure::Status { code, .. } => *code == 429 || *code >= 500,
            Failure::Network(_) | Failure::Timeout => true,
        }
    }

    pub fn rate_limit_reset(&self) -> Option<DateTime<Utc>> {
        match self {
            Failure::Status {
                rate_limit_reset, ..
            } => *rate_limit_reset,
            _ => None,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Status { code, .. } => write!(f, "HTTP {code}"),
            Failure::Network(msg) => write!(f, "network error: {msg}"),
            Failure::Timeout => f.write_str("request timed out"),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the attempt following attempt number `attempt` (1-indexed).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis().max(base_ms);

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u128.checked_shl(attempt - 1).unwrap_or(u128::MAX);
                base_ms.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base_ms.saturating_mul(attempt as u128),
        };

        Duration::from_millis(delay_ms.min(max_ms).min(u64::MAX as u128) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts failed
    /// with `failure`.
    pub fn should_retry(&self, attempt: u32, failure: &Failure) -> bool {
        attempt < self.max_attempts && failure.is_retryable()
    }

    /// How long to wait after `attempt` failed with `failure`.
    ///
    /// A provider-supplied rate-limit reset wins over the backoff curve.
    pub fn delay_after(&self, attempt: u32, failure: &Failure, now: DateTime<Utc>) -> Duration {
        match failure.rate_limit_reset() {
            Some(reset_at) => clock::until(now, reset_at),
            None => self.backoff_delay(attempt),
        }
    }
}

/// State of one retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded { .. } | RetryState::Failed { .. })
    }
}

/// `Idle → Attempting → Succeeded | Retrying | Failed`, driven by a policy.
///
/// The machine never sleeps; the caller waits out `Retrying::delay` on its
/// own clock and then calls [`RetryMachine::begin_attempt`] again.
#[derive(Debug, Clone)]
pub struct RetryMachine<'a> {
    policy: &'a RetryPolicy,
    state: RetryState,
}

impl<'a> RetryMachine<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle,
        }
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Start the next attempt. Returns its 1-indexed number, or `None` when
    /// the machine is not in a state that allows one.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        let attempt = match self.state {
            RetryState::Idle => 1,
            RetryState::Retrying { attempt, .. } => attempt + 1,
            _ => return None,
        };
        self.state = RetryState::Attempting { attempt };
        Some(attempt)
    }

    pub fn succeed(&mut self) -> &RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Succeeded { attempts: attempt };
        }
        &self.state
    }

    pub fn fail(&mut self, failure: &Failure, now: DateTime<Utc>) -> &RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = if self.policy.should_retry(attempt, failure) {
                RetryState::Retrying {
                    attempt,
                    delay: self.policy.delay_after(attempt, failure, now),
                }
            } else {
                RetryState::Failed { attempts: attempt }
            };
        }
        &self.state
    }
}
