//! Local ↔ remote identity mapping.
//!
//! A correlation is written once, when an entity is first linked to its
//! remote counterpart, and never remapped. Both directions are unique per
//! entity type: one local id maps to at most one remote id and vice versa.

mod memory;
mod postgres;

use chrono::{DateTime, Utc};
use serde::Serialize;

use fulfillsync_core::{EntityType, LocalId, RemoteId, SyncError};

pub use memory::InMemoryCorrelationStore;
pub use postgres::PostgresCorrelationStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorrelationRecord {
    pub entity_type: EntityType,
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub created_at: DateTime<Utc>,
}

/// Outcome of [`CorrelationStore::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationInsert {
    Created(CorrelationRecord),
    /// The exact pair was already recorded.
    Existing(CorrelationRecord),
}

impl CorrelationInsert {
    pub fn record(&self) -> &CorrelationRecord {
        match self {
            CorrelationInsert::Created(r) | CorrelationInsert::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> CorrelationRecord {
        match self {
            CorrelationInsert::Created(r) | CorrelationInsert::Existing(r) => r,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CorrelationError {
    /// One side of the pair is already linked to something else.
    #[error("{entity_type} correlation conflict: {detail}")]
    Conflict {
        entity_type: EntityType,
        detail: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<CorrelationError> for SyncError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::Conflict { .. } => SyncError::permanent(err.to_string()),
            CorrelationError::Storage(_) => SyncError::transient(err.to_string()),
        }
    }
}

#[async_trait::async_trait]
pub trait CorrelationStore: Send + Sync {
    async fn find_by_local(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<CorrelationRecord>, CorrelationError>;

    async fn find_by_remote(
        &self,
        entity_type: EntityType,
        remote_id: &RemoteId,
    ) -> Result<Option<CorrelationRecord>, CorrelationError>;

    /// Record a link. Idempotent for the same pair; a pair that would give
    /// either side a second partner is a [`CorrelationError::Conflict`].
    async fn insert(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        remote_id: RemoteId,
    ) -> Result<CorrelationInsert, CorrelationError>;
}

/// Decide the outcome of an insert that collided with existing rows.
pub(crate) fn resolve_collision(
    entity_type: EntityType,
    local_id: LocalId,
    remote_id: &RemoteId,
    by_local: Option<CorrelationRecord>,
    by_remote: Option<CorrelationRecord>,
) -> Result<CorrelationInsert, CorrelationError> {
    match (by_local, by_remote) {
        (Some(existing), _) if existing.remote_id == *remote_id => {
            Ok(CorrelationInsert::Existing(existing))
        }
        (Some(existing), _) => Err(CorrelationError::Conflict {
            entity_type,
            detail: format!(
                "local {local_id} is already linked to remote {}",
                existing.remote_id
            ),
        }),
        (None, Some(existing)) => Err(CorrelationError::Conflict {
            entity_type,
            detail: format!(
                "remote {remote_id} is already linked to local {}",
                existing.local_id
            ),
        }),
        (None, None) => Err(CorrelationError::Storage(format!(
            "insert of {entity_type} {local_id} <-> {remote_id} collided with a row that no longer exists"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::SystemClock;

    #[tokio::test]
    async fn insert_is_idempotent_for_the_same_pair() {
        let store = InMemoryCorrelationStore::new(Arc::new(SystemClock));
        let first = store
            .insert(EntityType::Order, LocalId::new(1), RemoteId::from("r-1"))
            .await
            .unwrap();
        assert!(matches!(first, CorrelationInsert::Created(_)));

        let second = store
            .insert(EntityType::Order, LocalId::new(1), RemoteId::from("r-1"))
            .await
            .unwrap();
        assert!(matches!(second, CorrelationInsert::Existing(_)));
        assert_eq!(first.record(), second.record());
    }

    #[tokio::test]
    async fn either_side_may_only_be_linked_once() {
        let store = InMemoryCorrelationStore::new(Arc::new(SystemClock));
        store
            .insert(EntityType::Product, LocalId::new(1), RemoteId::from("r-1"))
            .await
            .unwrap();

        let remote_taken = store
            .insert(EntityType::Product, LocalId::new(2), RemoteId::from("r-1"))
            .await;
        assert!(matches!(remote_taken, Err(CorrelationError::Conflict { .. })));

        let local_taken = store
            .insert(EntityType::Product, LocalId::new(1), RemoteId::from("r-2"))
            .await;
        assert!(matches!(local_taken, Err(CorrelationError::Conflict { .. })));

        // Entity types are separate namespaces.
        store
            .insert(EntityType::Order, LocalId::new(2), RemoteId::from("r-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_inserts_of_one_remote_id_create_one_record() {
        let store = Arc::new(InMemoryCorrelationStore::new(Arc::new(SystemClock)));
        let mut tasks = Vec::new();
        for local in 1..=8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .insert(EntityType::Order, LocalId::new(local), RemoteId::from("shared"))
                    .await
            }));
        }

        let mut created = 0;
        for task in tasks {
            if let Ok(CorrelationInsert::Created(_)) = task.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let record = store
            .find_by_remote(EntityType::Order, &RemoteId::from("shared"))
            .await
            .unwrap()
            .unwrap();
        let back = store
            .find_by_local(EntityType::Order, record.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, record);
    }
}
