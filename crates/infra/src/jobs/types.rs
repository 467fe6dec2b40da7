//! Core job types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use fulfillsync_core::{EntityType, SyncError};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of deferred work. Closed set: the dispatcher matches it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Push a local order to the provider.
    SyncOrder,
    /// Push a local product to the provider.
    SyncProduct,
    /// Pull a remote order after a webhook.
    RefreshOrder,
    /// Pull a remote product after a webhook.
    RefreshProduct,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::SyncOrder,
        JobType::SyncProduct,
        JobType::RefreshOrder,
        JobType::RefreshProduct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SyncOrder => "sync_order",
            JobType::SyncProduct => "sync_product",
            JobType::RefreshOrder => "refresh_order",
            JobType::RefreshProduct => "refresh_product",
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            JobType::SyncOrder | JobType::RefreshOrder => EntityType::Order,
            JobType::SyncProduct | JobType::RefreshProduct => EntityType::Product,
        }
    }

    /// Outbound sync job for an entity type.
    pub fn outbound(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Order => JobType::SyncOrder,
            EntityType::Product => JobType::SyncProduct,
        }
    }

    pub fn is_inbound(&self) -> bool {
        matches!(self, JobType::RefreshOrder | JobType::RefreshProduct)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::permanent(format!("unknown job type: {s}")))
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a dispatch cycle
    Processing,
    /// Completed successfully
    Completed,
    /// Failed, will be reset to pending by the sweep
    Failed,
    /// Terminal failure; kept for audit until purged
    Error,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SyncError::permanent(format!("unknown job status: {s}")))
    }
}

/// A durable unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Opaque payload; by convention JSON produced by the enqueuer.
    pub payload: Vec<u8>,
    pub status: JobStatus,
    /// Failed attempts so far. Never exceeds `max_attempts`.
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    /// When the current (or last) claim happened.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(job_type: JobType, payload: Vec<u8>, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            scheduled_for: now,
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    /// Schedule the job for later execution.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = at;
        self
    }

    /// Decode the JSON payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            SyncError::permanent(format!("malformed {} payload: {e}", self.job_type))
        })
    }

    /// Eligible for `dequeue_batch`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_for <= now
            && self.attempts < self.max_attempts
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
    }

    /// Give a claimed job back without consuming an attempt.
    pub fn release(&mut self) {
        self.status = JobStatus::Pending;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Record a failed attempt. Returns the resulting status.
    pub fn mark_failed(
        &mut self,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobStatus {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_error = Some(error.to_string());

        if self.attempts >= self.max_attempts {
            self.status = JobStatus::Error;
            self.completed_at = Some(now);
        } else {
            self.status = JobStatus::Failed;
            self.scheduled_for = retry_at;
        }
        self.status
    }

    /// Terminal failure that does not consume an attempt.
    pub fn mark_error(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Error;
        self.last_error = Some(error.to_string());
        self.completed_at = Some(now);
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub error: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Error => self.error += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lifecycle() {
        let now = Utc::now();
        let mut job = Job::new(JobType::SyncOrder, b"{}".to_vec(), 3, now);

        assert!(job.is_due(now));
        job.mark_processing(now);
        assert_eq!(job.status, JobStatus::Processing);
        assert!(!job.is_due(now));

        job.mark_completed(now);
        assert!(job.status.is_terminal());
        assert_eq!(job.completed_at, Some(now));
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn failures_become_terminal_at_max_attempts() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);
        let mut job = Job::new(JobType::SyncOrder, Vec::new(), 2, now);

        job.mark_processing(now);
        assert_eq!(job.mark_failed("HTTP 500", later, now), JobStatus::Failed);
        assert_eq!(job.scheduled_for, later);
        assert_eq!(job.attempts, 1);

        job.mark_processing(later);
        assert_eq!(job.mark_failed("HTTP 500", later, later), JobStatus::Error);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("HTTP 500"));

        // Attempts are clamped even if a caller keeps failing a terminal job.
        job.mark_failed("again", later, later);
        assert_eq!(job.attempts, 2);
    }

    #[test]
    fn mark_error_keeps_attempt_budget() {
        let now = Utc::now();
        let mut job = Job::new(JobType::SyncProduct, Vec::new(), 3, now);
        job.mark_processing(now);
        job.mark_error("product has no variants", now);

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn payload_decoding_errors_are_permanent() {
        #[derive(Debug, Deserialize)]
        struct OrderRef {
            #[allow(dead_code)]
            order_id: i64,
        }

        let job = Job::new(JobType::SyncOrder, b"not json".to_vec(), 3, Utc::now());
        let err = job.payload_as::<OrderRef>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn job_type_strings_round_trip() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
        assert_eq!(JobType::outbound(EntityType::Product), JobType::SyncProduct);
        assert!(JobType::RefreshOrder.is_inbound());
    }
}
