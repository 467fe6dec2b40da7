//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use fulfillsync_core::SyncError;

use crate::clock::{self, Clock, SystemClock};

use super::types::{Job, JobId, JobStats, JobStatus, JobType};

/// Durable FIFO-with-schedule queue of sync jobs.
///
/// A claimed job is visible to exactly one caller of [`JobStore::dequeue_batch`]
/// until it is completed, failed, released or reclaimed as stale.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending job. `scheduled_for` defaults to now.
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: Vec<u8>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim up to `limit` due jobs, ordered by `scheduled_for` then
    /// `created_at`, moving them to processing.
    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Return a claimed job to pending without consuming an attempt.
    async fn release(&self, id: JobId) -> Result<(), JobStoreError>;

    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Record a failed attempt. Returns `Failed` (will be retried at
    /// `retry_at`) or `Error` once the attempt budget is spent.
    async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError>;

    /// Terminal failure without consuming an attempt.
    async fn mark_error(&self, id: JobId, error: &str) -> Result<(), JobStoreError>;

    /// Move due failed jobs with remaining budget back to pending. Returns the count.
    async fn reset_failed(&self) -> Result<u64, JobStoreError>;

    /// Return jobs stuck in processing since before `older_than` to pending.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, JobStoreError>;

    /// Delete jobs in `status` that finished before `older_than`.
    async fn purge(&self, older_than: Duration, status: JobStatus) -> Result<u64, JobStoreError>;

    /// Delete a job that has not been claimed yet.
    async fn delete_pending(&self, id: JobId) -> Result<bool, JobStoreError>;

    /// Newest-first listing, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize)
    -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for SyncError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Storage(_) => SyncError::transient(err.to_string()),
            JobStoreError::NotFound(_) | JobStoreError::InvalidTransition { .. } => {
                SyncError::permanent(err.to_string())
            }
        }
    }
}

/// In-memory job store for tests/dev.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl InMemoryJobStore {
    pub fn new(clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
            max_attempts,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn update<F>(&self, id: JobId, to: JobStatus, f: F) -> Result<JobStatus, JobStoreError>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> JobStatus,
    {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Processing {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            });
        }
        Ok(f(job, now))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), 3)
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("jobs", &self.jobs.read().unwrap().len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: Vec<u8>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<JobId, JobStoreError> {
        let now = self.clock.now();
        let job = Job::new(job_type, payload, self.max_attempts, now)
            .scheduled_for(scheduled_for.unwrap_or(now));
        let id = job.id;
        self.jobs.write().unwrap().insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.read().unwrap().get(&id).cloned())
    }

    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap();

        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| (j.scheduled_for, j.created_at, j.id))
            .collect();
        // JobId is a v7 uuid, so it breaks ties in insertion order.
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_processing(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn release(&self, id: JobId) -> Result<(), JobStoreError> {
        self.update(id, JobStatus::Pending, |job, _| {
            job.release();
            job.status
        })
        .map(|_| ())
    }

    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError> {
        self.update(id, JobStatus::Completed, |job, now| {
            job.mark_completed(now);
            job.status
        })
        .map(|_| ())
    }

    async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError> {
        self.update(id, JobStatus::Failed, |job, now| {
            job.mark_failed(error, retry_at, now)
        })
    }

    async fn mark_error(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        self.update(id, JobStatus::Error, |job, now| {
            job.mark_error(error, now);
            job.status
        })
        .map(|_| ())
    }

    async fn reset_failed(&self) -> Result<u64, JobStoreError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().unwrap();
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Failed
                && job.attempts < job.max_attempts
                && job.scheduled_for <= now
            {
                job.status = JobStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, JobStoreError> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let mut jobs = self.jobs.write().unwrap();
        let mut count = 0;
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_none_or(|started| started < cutoff);
            if stale {
                job.release();
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge(&self, older_than: Duration, status: JobStatus) -> Result<u64, JobStoreError> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let finished = job.completed_at.unwrap_or(job.created_at);
            !(job.status == status && finished < cutoff)
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn delete_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                jobs.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.0.cmp(&a.id.0)));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}
