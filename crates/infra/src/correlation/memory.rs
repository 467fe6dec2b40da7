use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fulfillsync_core::{EntityType, LocalId, RemoteId};

use crate::clock::Clock;

use super::{
    CorrelationError, CorrelationInsert, CorrelationRecord, CorrelationStore, resolve_collision,
};

#[derive(Default)]
struct Index {
    by_local: HashMap<(EntityType, LocalId), CorrelationRecord>,
    by_remote: HashMap<(EntityType, RemoteId), LocalId>,
}

/// In-memory correlation table for tests/dev.
pub struct InMemoryCorrelationStore {
    index: RwLock<Index>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCorrelationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            clock,
        }
    }
}

impl std::fmt::Debug for InMemoryCorrelationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCorrelationStore")
            .field("records", &self.index.read().unwrap().by_local.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn find_by_local(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<CorrelationRecord>, CorrelationError> {
        let index = self.index.read().unwrap();
        Ok(index.by_local.get(&(entity_type, local_id)).cloned())
    }

    async fn find_by_remote(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<Option<CorrelationRecord>, CorrelationError> {
        let index = self.index.read().unwrap();
        Ok(index
            .by_remote
            .get(&(entity_type, remote_id.clone()))
            .and_then(|local| index.by_local.get(&(entity_type, *local)))
            .cloned())
    }

    async fn insert(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        remote_id: RemoteId,
    ) -> Result<CorrelationInsert, CorrelationError> {
        let mut index = self.index.write().unwrap();

        let by_local = index.by_local.get(&(entity_type, local_id)).cloned();
        let by_remote = index
            .by_remote
            .get(&(entity_type, remote_id.clone()))
            .and_then(|local| index.by_local.get(&(entity_type, *local)))
            .cloned();
        if by_local.is_some() || by_remote.is_some() {
            return resolve_collision(entity_type, local_id, &remote_id, by_local, by_remote);
        }

        let record = CorrelationRecord {
            entity_type,
            local_id,
            remote_id: remote_id.clone(),
            created_at: self.clock.now(),
        };
        index.by_remote.insert((entity_type, remote_id), local_id);
        index.by_local.insert((entity_type, local_id), record.clone());
        Ok(CorrelationInsert::Created(record))
    }
}
