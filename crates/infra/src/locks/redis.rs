//! Redis-backed leases (optional).
//!
//! A lease is a key `{prefix}{entity}` holding the JSON-encoded [`Lease`],
//! written with `SET NX PX` so Redis expires it on its own. Release is a
//! compare-and-delete script keyed on the holder token. The sync client is
//! driven from `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use redis::Commands;
use uuid::Uuid;

use fulfillsync_core::EntityKey;

use crate::clock::{self, Clock};
use crate::jobs::JobType;

use super::{Lease, LockError, LockManager};

const RELEASE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and cjson.decode(current).holder == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Clone)]
pub struct RedisLockManager {
    client: redis::Client,
    prefix: String,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl std::fmt::Debug for RedisLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockManager")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RedisLockManager {
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            clock,
            ttl,
        })
    }

    fn key(&self, entity_key: &str) -> String {
        format!("{}{}", self.prefix, entity_key)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LockError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LockError::Backend(format!("redis task failed: {e}")))?
        .map_err(|e| LockError::Backend(e.to_string()))
    }
}

#[async_trait::async_trait]
impl LockManager for RedisLockManager {
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
        let value =
            serde_json::to_string(&lease).map_err(|e| LockError::Backend(e.to_string()))?;
        let redis_key = self.key(&lease.entity_key);
        let ttl_ms = self.ttl.as_millis().max(1) as u64;

        let set: Option<String> = self
            .blocking(move |conn| {
                redis::cmd("SET")
                    .arg(redis_key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query(conn)
            })
            .await?;

        Ok(set.map(|_| lease))
    }

    async fn unlock(&self, lease: &Lease) -> Result<bool, LockError> {
        let redis_key = self.key(&lease.entity_key);
        let holder = lease.holder.to_string();
        let deleted: i64 = self
            .blocking(move |conn| {
                redis::Script::new(RELEASE_SCRIPT)
                    .key(redis_key)
                    .arg(holder)
                    .invoke(conn)
            })
            .await?;
        Ok(deleted > 0)
    }

    /// Redis expires keys itself; this only reports keys that are somehow
    /// left without a TTL and removes them.
    async fn reclaim_expired(&self) -> Result<u64, LockError> {
        let pattern = format!("{}*", self.prefix);
        self.blocking(move |conn| {
            let keys: Vec<String> = conn.keys(pattern)?;
            let mut removed = 0;
            for key in keys {
                let ttl: i64 = conn.ttl(&key)?;
                if ttl == -1 {
                    let _: i64 = conn.del(&key)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}
