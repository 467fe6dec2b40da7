//! Job dispatcher: periodic claim, lease, dispatch, settle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use fulfillsync_core::{EntityKey, ErrorKind, SyncError};

use crate::clock::{self, Clock};
use crate::locks::{LockError, LockManager};
use crate::retry::RetryPolicy;
use crate::sync_log::{SyncLog, SyncLogError};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus};

/// Work performed for each claimed job.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Entity the job operates on; the dispatcher leases it for the
    /// duration of `handle`.
    async fn entity_key(&self, job: &Job) -> Result<EntityKey, SyncError>;

    async fn handle(&self, job: &Job) -> Result<(), SyncError>;

    /// Called once when a job ends in `error`, with the failure that ended it.
    async fn on_terminal_failure(&self, _job: &Job, _error: &SyncError) {}
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Maximum jobs claimed per cycle
    pub batch_size: usize,
    pub interval: Duration,
    pub sweep_interval: Duration,
    /// Deferred retry budget.
    pub queue_policy: RetryPolicy,
    /// Processing jobs older than this are assumed abandoned.
    pub stale_after: Duration,
    /// Terminal jobs and sync-log entries older than this are purged.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "sync-dispatcher".to_string(),
            batch_size: 50,
            interval: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
            queue_policy: RetryPolicy::exponential(
                3,
                Duration::from_secs(60),
                Duration::from_secs(3600),
            ),
            stale_after: Duration::from_secs(300),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    SyncLog(#[from] SyncLogError),
}

/// How one claimed job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed with budget left; rescheduled.
    Failed,
    /// Terminal failure.
    Errored,
    /// Entity busy; released without consuming an attempt.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Errored => self.errored += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub reset_failed: u64,
    pub requeued_stale: u64,
    pub reclaimed_locks: u64,
    pub purged_jobs: u64,
    pub purged_log_entries: u64,
}

/// Runtime statistics of a spawned dispatcher.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub sweeps: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_errored: u64,
    pub jobs_skipped: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DispatcherStats {
    fn record_cycle(&mut self, report: &CycleReport, at: DateTime<Utc>) {
        self.cycles += 1;
        self.jobs_completed += report.completed as u64;
        self.jobs_failed += report.failed as u64;
        self.jobs_errored += report.errored as u64;
        self.jobs_skipped += report.skipped as u64;
        self.last_cycle_at = Some(at);
    }
}

/// Claims due jobs in batches and runs each under its entity lease.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn LockManager>,
    handler: Arc<dyn JobHandler>,
    sync_log: Option<Arc<dyn SyncLog>>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        handler: Arc<dyn JobHandler>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            locks,
            handler,
            sync_log: None,
            clock,
            config,
        }
    }

    pub fn with_sync_log(mut self, sync_log: Arc<dyn SyncLog>) -> Self {
        self.sync_log = Some(sync_log);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim one batch and settle every job in it.
    ///
    /// A failure to settle one job is logged and does not stop the batch;
    /// that job stays in processing until `requeue_stale` picks it up.
    pub async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        let jobs = self.store.dequeue_batch(self.config.batch_size).await?;
        let mut report = CycleReport {
            claimed: jobs.len(),
            ..CycleReport::default()
        };

        for job in jobs {
            match self.process(&job).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => error!(
                    dispatcher = %self.config.name,
                    job_id = %job.id,
                    error = %e,
                    "failed to settle job"
                ),
            }
        }

        if report.claimed > 0 {
            info!(
                dispatcher = %self.config.name,
                claimed = report.claimed,
                completed = report.completed,
                failed = report.failed,
                errored = report.errored,
                skipped = report.skipped,
                "dispatch cycle finished"
            );
        }
        Ok(report)
    }

    async fn process(&self, job: &Job) -> Result<JobOutcome, DispatchError> {
        let key = match self.handler.entity_key(job).await {
            Ok(key) => key,
            Err(e) => return self.settle_failure(job, e).await,
        };

        let lease = match self.locks.try_lock(&key, job.job_type).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(job_id = %job.id, entity = %key, "entity busy, releasing job");
                self.store.release(job.id).await?;
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => {
                warn!(job_id = %job.id, entity = %key, error = %e, "lock unavailable, releasing job");
                self.store.release(job.id).await?;
                return Ok(JobOutcome::Skipped);
            }
        };

        let result = self.handler.handle(job).await;
        let outcome = match result {
            Ok(()) => {
                self.store.mark_completed(job.id).await?;
                debug!(job_id = %job.id, job_type = %job.job_type, entity = %key, "job completed");
                Ok(JobOutcome::Completed)
            }
            Err(e) => self.settle_failure(job, e).await,
        };

        match self.locks.unlock(&lease).await {
            Ok(true) => {}
            Ok(false) => warn!(entity = %key, "lease expired before the job finished"),
            Err(e) => warn!(entity = %key, error = %e, "failed to release lease"),
        }
        outcome
    }

    async fn settle_failure(
        &self,
        job: &Job,
        err: SyncError,
    ) -> Result<JobOutcome, DispatchError> {
        let message = err.to_string();

        let status = match err.kind() {
            ErrorKind::Transient => {
                let delay = self.config.queue_policy.backoff_delay(job.attempts + 1);
                let backoff_at = clock::after(self.clock.now(), delay);
                // A provider quota reset beats the backoff curve when it is later.
                let retry_at = err
                    .retry_not_before()
                    .map_or(backoff_at, |reset| reset.max(backoff_at));
                self.store.mark_failed(job.id, &message, retry_at).await?
            }
            ErrorKind::Permanent | ErrorKind::Configuration | ErrorKind::Signature => {
                self.store.mark_error(job.id, &message).await?;
                JobStatus::Error
            }
        };

        if status == JobStatus::Error {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                kind = err.kind().as_str(),
                error = %message,
                "job failed permanently"
            );
            self.handler.on_terminal_failure(job, &err).await;
            Ok(JobOutcome::Errored)
        } else {
            debug!(job_id = %job.id, error = %message, "job failed, will retry");
            Ok(JobOutcome::Failed)
        }
    }

    /// Housekeeping: reset due failures, recover abandoned work, expire
    /// leases and drop old records.
    pub async fn sweep(&self) -> Result<SweepReport, DispatchError> {
        let retention = self.config.retention;
        let mut report = SweepReport {
            reset_failed: self.store.reset_failed().await?,
            requeued_stale: self.store.requeue_stale(self.config.stale_after).await?,
            reclaimed_locks: self.locks.reclaim_expired().await?,
            ..SweepReport::default()
        };
        report.purged_jobs = self.store.purge(retention, JobStatus::Completed).await?
            + self.store.purge(retention, JobStatus::Error).await?;
        if let Some(sync_log) = &self.sync_log {
            report.purged_log_entries = sync_log.purge(retention).await?;
        }

        debug!(dispatcher = %self.config.name, ?report, "sweep finished");
        Ok(report)
    }

    /// Run cycles and sweeps on their intervals until shut down.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));

        let join = tokio::spawn({
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            async move {
                info!(dispatcher = %self.config.name, "dispatcher started");

                let mut cycle = tokio::time::interval(self.config.interval);
                cycle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut sweep = tokio::time::interval(self.config.sweep_interval);
                sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = cycle.tick() => {
                            let result = self.run_cycle().await;
                            let mut s = stats.lock().unwrap();
                            match result {
                                Ok(report) => s.record_cycle(&report, self.clock.now()),
                                Err(e) => {
                                    error!(dispatcher = %self.config.name, error = %e, "dispatch cycle failed");
                                    s.last_error = Some(e.to_string());
                                }
                            }
                        }
                        _ = sweep.tick() => {
                            let result = self.sweep().await;
                            let mut s = stats.lock().unwrap();
                            match result {
                                Ok(_) => s.sweeps += 1,
                                Err(e) => {
                                    error!(dispatcher = %self.config.name, error = %e, "sweep failed");
                                    s.last_error = Some(e.to_string());
                                }
                            }
                        }
                    }
                }

                info!(dispatcher = %self.config.name, "dispatcher stopped");
            }
        });

        DispatcherHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<tokio::sync::Notify>,
    join: Option<tokio::task::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop after the current cycle and wait for the task to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap().clone()
    }
}
