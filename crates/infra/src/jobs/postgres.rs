//! Postgres-backed job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so several dispatchers can poll the
//! same table without handing one job to two of them. Every status transition
//! is a single conditional `UPDATE`; a transition whose precondition no longer
//! holds affects zero rows and is reported as [`JobStoreError::InvalidTransition`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use crate::clock::{self, Clock};
use crate::db;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobId, JobStats, JobStatus, JobType};

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, created_at, \
                           scheduled_for, started_at, completed_at, last_error";

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, max_attempts: u32) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Work out why a conditional update touched no row.
    async fn transition_error(&self, id: JobId, to: JobStatus) -> JobStoreError {
        match self.get(id).await {
            Ok(Some(job)) => JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to,
            },
            Ok(None) => JobStoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(to.as_str(), e))?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, to).await);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, payload), fields(job_type = %job_type), err)]
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: Vec<u8>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<JobId, JobStoreError> {
        let now = self.clock.now();
        let job = Job::new(job_type, payload, self.max_attempts, now)
            .scheduled_for(scheduled_for.unwrap_or(now));

        sqlx::query(
            r#"
            INSERT INTO sync_jobs (id, job_type, payload, status, attempts, max_attempts,
                                   created_at, scheduled_for)
            VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6)
            "#,
        )
        .bind(job.id.0)
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    #[instrument(skip(self), fields(claimed), err)]
    async fn dequeue_batch(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let now = self.clock.now();
        let rows = sqlx::query(&format!(
            r#"
            UPDATE sync_jobs
            SET status = 'processing', started_at = $1
            WHERE id IN (
                SELECT id FROM sync_jobs
                WHERE status = 'pending'
                  AND scheduled_for <= $1
                  AND attempts < max_attempts
                ORDER BY scheduled_for, created_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dequeue_batch", e))?;

        // RETURNING does not preserve the subquery order.
        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| {
            (a.scheduled_for, a.created_at, a.id.0).cmp(&(b.scheduled_for, b.created_at, b.id.0))
        });

        tracing::Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn release(&self, id: JobId) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            "UPDATE sync_jobs SET status = 'pending' WHERE id = $1 AND status = 'processing'",
        )
        .bind(id.0);
        self.transition(id, JobStatus::Pending, query).await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn mark_completed(&self, id: JobId) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'completed', completed_at = $2
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(self.clock.now());
        self.transition(id, JobStatus::Completed, query).await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<JobStatus, JobStoreError> {
        // Right-hand sides of SET see the pre-update row.
        let row = sqlx::query(
            r#"
            UPDATE sync_jobs
            SET attempts      = LEAST(attempts + 1, max_attempts),
                last_error    = $2,
                status        = CASE WHEN attempts + 1 >= max_attempts
                                     THEN 'error' ELSE 'failed' END,
                scheduled_for = CASE WHEN attempts + 1 >= max_attempts
                                     THEN scheduled_for ELSE $3 END,
                completed_at  = CASE WHEN attempts + 1 >= max_attempts
                                     THEN $4 ELSE completed_at END
            WHERE id = $1 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(retry_at)
        .bind(self.clock.now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;

        match row {
            Some(row) => {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| map_sqlx_error("mark_failed", e))?;
                parse_status(&status)
            }
            None => Err(self.transition_error(id, JobStatus::Failed).await),
        }
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn mark_error(&self, id: JobId, error: &str) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'error', last_error = $2, completed_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.0)
        .bind(error)
        .bind(self.clock.now());
        self.transition(id, JobStatus::Error, query).await
    }

    #[instrument(skip(self), err)]
    async fn reset_failed(&self) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'pending'
            WHERE status = 'failed' AND attempts < max_attempts AND scheduled_for <= $1
            "#,
        )
        .bind(self.clock.now())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_failed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, JobStoreError> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'pending'
            WHERE status = 'processing' AND (started_at IS NULL OR started_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn purge(&self, older_than: Duration, status: JobStatus) -> Result<u64, JobStoreError> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let result = sqlx::query(
            r#"
            DELETE FROM sync_jobs
            WHERE status = $1 AND COALESCE(completed_at, created_at) < $2
            "#,
        )
        .bind(status.as_str())
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge", e))?;
        Ok(result.rows_affected())
    }

    async fn delete_pending(&self, id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = $1 AND status = 'pending'")
            .bind(id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_pending", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM sync_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM sync_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(parse_status(&status)?, count as usize);
        }
        Ok(stats)
    }
}

struct JobRow {
    id: Uuid,
    job_type: String,
    payload: Vec<u8>,
    status: String,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            scheduled_for: row.try_get("scheduled_for")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row
                .job_type
                .parse()
                .map_err(|e: fulfillsync_core::SyncError| JobStoreError::Storage(e.to_string()))?,
            payload: row.payload,
            status: parse_status(&row.status)?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            created_at: row.created_at,
            scheduled_for: row.scheduled_for,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_error: row.last_error,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {e}")))?;
    Job::try_from(row)
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|e: fulfillsync_core::SyncError| JobStoreError::Storage(e.to_string()))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    if db::is_unavailable(&err) {
        return JobStoreError::Storage(format!("database unavailable in {operation}: {err}"));
    }
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
