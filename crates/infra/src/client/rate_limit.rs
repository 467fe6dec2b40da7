//! Provider quota headers.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;

pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Reset values above this are unix timestamps, below it second offsets.
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// No reported reset is trusted further out than this.
const MAX_RESET_SECS: i64 = 24 * 60 * 60;

/// Quota state reported on a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    /// Read quota headers. `retry-after` wins over `x-ratelimit-reset`.
    pub fn from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let remaining = header_i64(headers, REMAINING_HEADER)
            .map(|v| u32::try_from(v.max(0)).unwrap_or(u32::MAX));
        let reset_at = header_i64(headers, RETRY_AFTER_HEADER)
            .map(|secs| offset(now, secs))
            .or_else(|| header_i64(headers, RESET_HEADER).map(|raw| reset_time(now, raw)));

        Self {
            remaining,
            reset_at,
        }
    }

    /// The provider said no calls are left in this window.
    pub fn exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.ceil() as i64)
}

fn reset_time(now: DateTime<Utc>, raw: i64) -> DateTime<Utc> {
    if raw >= EPOCH_THRESHOLD {
        offset(now, raw.saturating_sub(now.timestamp()))
    } else {
        offset(now, raw)
    }
}

fn offset(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(secs.clamp(0, MAX_RESET_SECS))
}
