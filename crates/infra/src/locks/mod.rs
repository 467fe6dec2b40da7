//! Per-entity lease locks.
//!
//! At most one live lease exists per entity key. A lease expires after its
//! TTL so a crashed worker cannot wedge an entity forever; an expired lease
//! may be taken over by the next `try_lock` or cleared by `reclaim_expired`.
//! Only the holder of a lease can release it.

mod memory;
mod postgres;
#[cfg(feature = "redis")]
mod redis;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use fulfillsync_core::{EntityKey, SyncError};

use crate::jobs::JobType;

pub use memory::InMemoryLockManager;
pub use postgres::PostgresLockManager;
#[cfg(feature = "redis")]
pub use redis::RedisLockManager;

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub entity_key: String,
    pub job_type: JobType,
    /// Random token proving ownership.
    pub holder: Uuid,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        SyncError::transient(err.to_string())
    }
}

#[async_trait::async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the lease for `key`, or `None` if someone else holds a live one.
    async fn try_lock(&self, key: &EntityKey, job_type: JobType)
    -> Result<Option<Lease>, LockError>;

    /// Release a lease. Returns `false` if it had already expired and been
    /// taken over (or cleared).
    async fn unlock(&self, lease: &Lease) -> Result<bool, LockError>;

    /// Delete every expired lease. Returns the count.
    async fn reclaim_expired(&self) -> Result<u64, LockError>;
}
