//! Outbound call log.
//!
//! One entry per logical API request (its terminal attempt), kept
//! for the retention window and used to inspect provider latency and quota.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::clock::{self, Clock};
use crate::db;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLogEntry {
    pub endpoint: String,
    pub method: String,
    /// `None` when no response was received.
    pub status: Option<u16>,
    pub response_time_ms: u64,
    pub rate_limit_remaining: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("sync log error: {0}")]
pub struct SyncLogError(pub String);

#[async_trait::async_trait]
pub trait SyncLog: Send + Sync {
    async fn append(&self, entry: SyncLogEntry) -> Result<(), SyncLogError>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>, SyncLogError>;

    /// Drop entries older than `older_than`. Returns the count.
    async fn purge(&self, older_than: Duration) -> Result<u64, SyncLogError>;
}

/// Bounded in-memory log; the oldest entries fall off past `capacity`.
pub struct InMemorySyncLog {
    entries: Mutex<VecDeque<SyncLogEntry>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl InMemorySyncLog {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl SyncLog for InMemorySyncLog {
    async fn append(&self, entry: SyncLogEntry) -> Result<(), SyncLogError> {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>, SyncLogError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn purge(&self, older_than: Duration) -> Result<u64, SyncLogError> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Clone)]
pub struct PostgresSyncLog {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PostgresSyncLog {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
        }
    }
}

#[async_trait::async_trait]
impl SyncLog for PostgresSyncLog {
    async fn append(&self, entry: SyncLogEntry) -> Result<(), SyncLogError> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (endpoint, method, status, response_time_ms,
                                  rate_limit_remaining, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.endpoint)
        .bind(&entry.method)
        .bind(entry.status.map(i32::from))
        .bind(entry.response_time_ms as i64)
        .bind(entry.rate_limit_remaining.map(|r| r as i32))
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append", e))?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SyncLogEntry>, SyncLogError> {
        let rows = sqlx::query(
            r#"
            SELECT endpoint, method, status, response_time_ms, rate_limit_remaining, created_at
            FROM sync_log
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent", e))?;

        rows.iter()
            .map(|row| {
                let status: Option<i32> = row.try_get("status")?;
                let response_time_ms: i64 = row.try_get("response_time_ms")?;
                let remaining: Option<i32> = row.try_get("rate_limit_remaining")?;
                Ok(SyncLogEntry {
                    endpoint: row.try_get("endpoint")?,
                    method: row.try_get("method")?,
                    status: status.map(|s| s as u16),
                    response_time_ms: response_time_ms.max(0) as u64,
                    rate_limit_remaining: remaining.map(|r| r.max(0) as u32),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(|e| map_sqlx_error("recent", e))
    }

    async fn purge(&self, older_than: Duration) -> Result<u64, SyncLogError> {
        let cutoff = clock::before(self.clock.now(), older_than);
        let result = sqlx::query("DELETE FROM sync_log WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge", e))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SyncLogError {
    if db::is_unavailable(&err) {
        return SyncLogError(format!("database unavailable in {operation}: {err}"));
    }
    SyncLogError(format!("sqlx error in {operation}: {err}"))
}
