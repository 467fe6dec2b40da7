use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use fulfillsync_core::EntityKey;

use crate::clock::{self, Clock};
use crate::jobs::JobType;

use super::{Lease, LockError, LockManager};

/// Process-local lease table.
pub struct InMemoryLockManager {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl InMemoryLockManager {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
            ttl,
        }
    }
}

impl std::fmt::Debug for InMemoryLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLockManager")
            .field("held", &self.leases.lock().unwrap().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[async_trait::async_trait]
impl LockManager for InMemoryLockManager {
    async fn try_lock(
        &self,
        key: &EntityKey,
        job_type: JobType,
    ) -> Result<Option<Lease>, LockError> {
        let now = self.clock.now();
        let entity_key = key.to_string();
        let mut leases = self.leases.lock().unwrap();

        if let Some(existing) = leases.get(&entity_key) {
            if !existing.is_expired(now) {
                return Ok(None);
            }
            tracing::debug!(entity = %entity_key, "taking over expired lease");
        }

        let lease = Lease {
            entity_key: entity_key.clone(),
            job_type,
            holder: Uuid::new_v4(),
            locked_at: now,
            expires_at: clock::after(now, self.ttl),
        };
        leases.insert(entity_key, lease.clone());
        Ok(Some(lease))
    }

    async fn unlock(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().unwrap();
        match leases.get(&lease.entity_key) {
            Some(current) if current.holder == lease.holder => {
                leases.remove(&lease.entity_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_expired(&self) -> Result<u64, LockError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap();
        let before = leases.len();
        leases.retain(|_, lease| !lease.is_expired(now));
        Ok((before - leases.len()) as u64)
    }
}
