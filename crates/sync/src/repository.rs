//! Entity Repository: the host commerce system's storage, seen from sync.

use std::collections::HashMap;
use std::sync::RwLock;

use fulfillsync_core::{EntityType, LocalId, SyncError};

use crate::model::{LocalOrder, LocalProduct, SyncMeta};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: LocalId },
    #[error("repository error: {0}")]
    Storage(String),
}

impl From<RepositoryError> for SyncError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { .. } => SyncError::permanent(err.to_string()),
            RepositoryError::Storage(_) => SyncError::transient(err.to_string()),
        }
    }
}

/// In-place change to an entity's [`SyncMeta`].
pub type MetaUpdate<'a> = Box<dyn FnOnce(&mut SyncMeta) + Send + 'a>;

#[async_trait::async_trait]
pub trait EntityRepository: Send + Sync {
    async fn load_order(&self, id: LocalId) -> Result<Option<LocalOrder>, RepositoryError>;

    async fn save_order(&self, order: &LocalOrder) -> Result<(), RepositoryError>;

    /// Persist a new order and return its id; `draft.id` is ignored.
    async fn create_order(&self, draft: LocalOrder) -> Result<LocalId, RepositoryError>;

    async fn load_product(&self, id: LocalId) -> Result<Option<LocalProduct>, RepositoryError>;

    async fn save_product(&self, product: &LocalProduct) -> Result<(), RepositoryError>;

    /// Persist a new product and return its id; `draft.id` is ignored.
    async fn create_product(&self, draft: LocalProduct) -> Result<LocalId, RepositoryError>;

    /// Sync bookkeeping for an entity; defaults when none was stored yet.
    async fn get_meta(
        &self,
        entity_type: EntityType,
        id: LocalId,
    ) -> Result<SyncMeta, RepositoryError>;

    /// Apply `update` to the stored bookkeeping as one atomic step and
    /// return the result. Fields the update does not touch keep whatever a
    /// concurrent writer stored.
    async fn update_meta(
        &self,
        entity_type: EntityType,
        id: LocalId,
        update: MetaUpdate<'_>,
    ) -> Result<SyncMeta, RepositoryError>;

    /// Append a human-readable note to the entity's history.
    async fn add_note(
        &self,
        entity_type: EntityType,
        id: LocalId,
        note: &str,
    ) -> Result<(), RepositoryError>;
}

#[derive(Debug, Default)]
struct Tables {
    orders: HashMap<LocalId, LocalOrder>,
    products: HashMap<LocalId, LocalProduct>,
    meta: HashMap<(EntityType, LocalId), SyncMeta>,
    notes: HashMap<(EntityType, LocalId), Vec<String>>,
    next_id: i64,
}

/// In-memory repository for tests/dev.
#[derive(Debug)]
pub struct InMemoryEntityRepository {
    inner: RwLock<Tables>,
}

impl InMemoryEntityRepository {
    /// Ids handed out by `create_*` start at 10 000 to stay clear of
    /// hand-picked fixture ids.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables {
                next_id: 10_000,
                ..Tables::default()
            }),
        }
    }

    pub fn insert_order(&self, order: LocalOrder) {
        self.inner.write().unwrap().orders.insert(order.id, order);
    }

    pub fn insert_product(&self, product: LocalProduct) {
        self.inner.write().unwrap().products.insert(product.id, product);
    }

    pub fn notes(&self, entity_type: EntityType, id: LocalId) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .notes
            .get(&(entity_type, id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn order_count(&self) -> usize {
        self.inner.read().unwrap().orders.len()
    }

    pub fn product_count(&self) -> usize {
        self.inner.read().unwrap().products.len()
    }
}

impl Default for InMemoryEntityRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EntityRepository for InMemoryEntityRepository {
    async fn load_order(&self, id: LocalId) -> Result<Option<LocalOrder>, RepositoryError> {
        Ok(self.inner.read().unwrap().orders.get(&id).cloned())
    }

    async fn save_order(&self, order: &LocalOrder) -> Result<(), RepositoryError> {
        let mut tables = self.inner.write().unwrap();
        match tables.orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                entity_type: EntityType::Order,
                id: order.id,
            }),
        }
    }

    async fn create_order(&self, mut draft: LocalOrder) -> Result<LocalId, RepositoryError> {
        let mut tables = self.inner.write().unwrap();
        tables.next_id += 1;
        draft.id = LocalId::new(tables.next_id);
        let id = draft.id;
        tables.orders.insert(id, draft);
        Ok(id)
    }

    async fn load_product(&self, id: LocalId) -> Result<Option<LocalProduct>, RepositoryError> {
        Ok(self.inner.read().unwrap().products.get(&id).cloned())
    }

    async fn save_product(&self, product: &LocalProduct) -> Result<(), RepositoryError> {
        let mut tables = self.inner.write().unwrap();
        match tables.products.get_mut(&product.id) {
            Some(existing) => {
                *existing = product.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                entity_type: EntityType::Product,
                id: product.id,
            }),
        }
    }

    async fn create_product(&self, mut draft: LocalProduct) -> Result<LocalId, RepositoryError> {
        let mut tables = self.inner.write().unwrap();
        tables.next_id += 1;
        draft.id = LocalId::new(tables.next_id);
        let id = draft.id;
        tables.products.insert(id, draft);
        Ok(id)
    }

    async fn get_meta(
        &self,
        entity_type: EntityType,
        id: LocalId,
    ) -> Result<SyncMeta, RepositoryError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .meta
            .get(&(entity_type, id))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_meta(
        &self,
        entity_type: EntityType,
        id: LocalId,
        update: MetaUpdate<'_>,
    ) -> Result<SyncMeta, RepositoryError> {
        let mut tables = self.inner.write().unwrap();
        let meta = tables.meta.entry((entity_type, id)).or_default();
        update(meta);
        Ok(meta.clone())
    }

    async fn add_note(
        &self,
        entity_type: EntityType,
        id: LocalId,
        note: &str,
    ) -> Result<(), RepositoryError> {
        self.inner
            .write()
            .unwrap()
            .notes
            .entry((entity_type, id))
            .or_default()
            .push(note.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use fulfillsync_core::{LocalOrderStatus, RemoteId, SyncStatus};

    use super::*;
    use crate::model::ShippingAddress;

    fn order(id: i64) -> LocalOrder {
        LocalOrder {
            id: LocalId::new(id),
            status: LocalOrderStatus::Processing,
            shipping_method: "flat_rate".to_string(),
            shipping: ShippingAddress::default(),
            line_items: vec![],
        }
    }

    #[tokio::test]
    async fn created_orders_get_fresh_ids() {
        let repo = InMemoryEntityRepository::new();
        repo.insert_order(order(42));

        let a = repo.create_order(order(42)).await.unwrap();
        let b = repo.create_order(order(42)).await.unwrap();
        assert_ne!(a, b);
        assert_ne!(a, LocalId::new(42));
        assert_eq!(repo.order_count(), 3);
    }

    #[tokio::test]
    async fn saving_an_unknown_order_is_not_found() {
        let repo = InMemoryEntityRepository::new();
        let err = repo.save_order(&order(7)).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound { .. }));
        assert!(!SyncError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn meta_defaults_to_not_synced() {
        let repo = InMemoryEntityRepository::new();
        let meta = repo.get_meta(EntityType::Order, LocalId::new(1)).await.unwrap();
        assert_eq!(meta.sync_status, SyncStatus::NotSynced);
        assert!(meta.remote_id.is_none());
    }

    #[tokio::test]
    async fn meta_updates_only_touch_their_own_fields() {
        let repo = InMemoryEntityRepository::new();
        let (kind, id) = (EntityType::Order, LocalId::new(1));
        let at = Utc::now();

        repo.update_meta(kind, id, Box::new(|meta: &mut SyncMeta| meta.synced(RemoteId::from("r-1"), at)))
            .await
            .unwrap();
        let meta = repo
            .update_meta(kind, id, Box::new(|meta: &mut SyncMeta| meta.last_error = Some("HTTP 502".into())))
            .await
            .unwrap();

        assert_eq!(meta.remote_id, Some(RemoteId::from("r-1")));
        assert_eq!(meta.last_synced_at, Some(at));
        assert_eq!(meta.last_error.as_deref(), Some("HTTP 502"));
        assert_eq!(repo.get_meta(kind, id).await.unwrap(), meta);
    }
}
