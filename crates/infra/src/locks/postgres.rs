use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use fulfillsync_core::EntityKey;

use crate::clock::{self, Clock};
use crate::db;
use crate::jobs::JobType;

use super::{Lease, LockError, LockManager};

/// Lease table in Postgres, shared by every worker on the same database.
///
/// Acquisition is one upsert that only overwrites an existing row when its
/// lease has expired, so concurrent callers race on the row lock and exactly
/// one of them sees `RETURNING` produce a row.
#[derive(Clone)]
pub struct PostgresLockManager {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl PostgresLockManager {
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            clock,
            ttl,
        }
    }
}

#[async_trait::async_trait]
impl LockManager for PostgresLockManager {
    #[instrument(skip(self), fields(entity = %key), err)]
    async fn try_lock(
        &self,
        key: &EntityKey,
        job_type: JobType,
    ) -> Result<Option<Lease>, LockError> {
        let now = self.clock.now();
        let lease = Lease {
            entity_key: key.to_string(),
            job_type,
            holder: Uuid::new_v4(),
            locked_at: now,
            expires_at: clock::after(now, self.ttl),
        };

        let acquired = sqlx::query(
            r#"
            INSERT INTO sync_locks (entity_key, job_type, holder, locked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_key) DO UPDATE
                SET job_type = EXCLUDED.job_type,
                    holder = EXCLUDED.holder,
                    locked_at = EXCLUDED.locked_at,
                    expires_at = EXCLUDED.expires_at
                WHERE sync_locks.expires_at <= EXCLUDED.locked_at
            RETURNING holder
            "#,
        )
        .bind(&lease.entity_key)
        .bind(lease.job_type.as_str())
        .bind(lease.holder)
        .bind(lease.locked_at)
        .bind(lease.expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_lock", e))?;

        Ok(acquired.map(|_| lease))
    }

    #[instrument(skip(self, lease), fields(entity = %lease.entity_key), err)]
    async fn unlock(&self, lease: &Lease) -> Result<bool, LockError> {
        let result = sqlx::query("DELETE FROM sync_locks WHERE entity_key = $1 AND holder = $2")
            .bind(&lease.entity_key)
            .bind(lease.holder)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("unlock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn reclaim_expired(&self) -> Result<u64, LockError> {
        let result = sqlx::query("DELETE FROM sync_locks WHERE expires_at <= $1")
            .bind(self.clock.now())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reclaim_expired", e))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LockError {
    if db::is_unavailable(&err) {
        return LockError::Backend(format!("database unavailable in {operation}: {err}"));
    }
    LockError::Backend(format!("sqlx error in {operation}: {err}"))
}
