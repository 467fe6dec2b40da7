//! Product synchronization.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use fulfillsync_core::{
    EntityType, LocalId, LocalProductStatus, RemoteId, SyncError, SyncResult, SyncStatus,
};
use fulfillsync_infra::clock::Clock;
use fulfillsync_infra::correlation::{CorrelationError, CorrelationStore};

use crate::model::{LocalProduct, ProductVariant, SyncMeta};
use crate::payload::{ProductPayload, build_product_payload, publishing_succeeded_payload};
use crate::remote::{ProviderApi, RemoteProduct};
use crate::repository::EntityRepository;
use crate::webhook::WebhookTopic;

pub struct ProductSync {
    repo: Arc<dyn EntityRepository>,
    correlations: Arc<dyn CorrelationStore>,
    api: ProviderApi,
    clock: Arc<dyn Clock>,
}

impl ProductSync {
    pub fn new(
        repo: Arc<dyn EntityRepository>,
        correlations: Arc<dyn CorrelationStore>,
        api: ProviderApi,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            correlations,
            api,
            clock,
        }
    }

    /// Push a local product to the provider, publishing it if it is
    /// published locally.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub async fn sync_outbound(&self, product_id: LocalId) -> SyncResult<()> {
        let product = self
            .repo
            .load_product(product_id)
            .await?
            .ok_or_else(|| SyncError::permanent(format!("product {product_id} not found")))?;
        let payload = validate(&product)?;
        let existing = self
            .correlations
            .find_by_local(EntityType::Product, product_id)
            .await?;
        if let Some(record) = &existing {
            let meta = self.repo.get_meta(EntityType::Product, product_id).await?;
            if meta.remote_id.is_none() && meta.last_synced_at.is_some() {
                return Err(SyncError::permanent(format!(
                    "product {product_id} is linked to {} which the provider deleted",
                    record.remote_id
                )));
            }
        }

        let (remote_id, mut note) = match existing {
            Some(record) => {
                self.api.update_product(&record.remote_id, &payload).await?;
                let note = format!("Fulfillment product {} updated", record.remote_id);
                (record.remote_id, note)
            }
            None => {
                let created = self.api.create_product(&payload).await?;
                let remote_id = self.link_created(product_id, created, &payload).await?;
                let note = format!("Fulfillment product {remote_id} created");
                (remote_id, note)
            }
        };

        if product.status == LocalProductStatus::Publish {
            self.api.publish_product(&remote_id).await?;
            note.push_str(" and published");
        }
        note.push('.');

        self.mark_synced(product_id, &remote_id).await?;
        self.repo
            .add_note(EntityType::Product, product_id, &note)
            .await?;

        info!(product_id = %product_id, remote_id = %remote_id, "product synced");
        Ok(())
    }

    async fn link_created(
        &self,
        product_id: LocalId,
        created: RemoteId,
        payload: &ProductPayload,
    ) -> SyncResult<RemoteId> {
        match self
            .correlations
            .insert(EntityType::Product, product_id, created.clone())
            .await
        {
            Ok(insert) => Ok(insert.into_record().remote_id),
            Err(conflict @ CorrelationError::Conflict { .. }) => {
                let Some(winner) = self
                    .correlations
                    .find_by_local(EntityType::Product, product_id)
                    .await?
                else {
                    return Err(conflict.into());
                };
                warn!(
                    product_id = %product_id,
                    orphaned = %created,
                    kept = %winner.remote_id,
                    "lost correlation race, updating the linked remote product"
                );
                self.api.update_product(&winner.remote_id, payload).await?;
                Ok(winner.remote_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// React to a provider product event. Returns the local product it
    /// touched, if any.
    #[instrument(skip(self), fields(remote_id = %remote_id, topic = %topic), err)]
    pub async fn refresh(
        &self,
        remote_id: &RemoteId,
        topic: WebhookTopic,
    ) -> SyncResult<Option<LocalId>> {
        if topic == WebhookTopic::ProductDeleted {
            return self.unlink(remote_id).await;
        }

        let snapshot = self.api.get_product(remote_id).await?;
        let product_id = self.resolve_local(remote_id, &snapshot).await?;
        let mut product = self.repo.load_product(product_id).await?.ok_or_else(|| {
            SyncError::permanent(format!(
                "product {product_id} linked to remote {remote_id} no longer exists"
            ))
        })?;

        let status = if topic == WebhookTopic::ProductPublishStarted {
            self.api
                .publishing_succeeded(remote_id, &publishing_succeeded_payload(&product))
                .await?;
            LocalProductStatus::Publish
        } else {
            snapshot.local_status()
        };

        if product.status != status {
            let note = format!(
                "Fulfillment update ({topic}): status {} -> {}.",
                product.status.as_str(),
                status.as_str()
            );
            product.status = status;
            self.repo.save_product(&product).await?;
            self.repo
                .add_note(EntityType::Product, product_id, &note)
                .await?;
            info!(product_id = %product_id, status = status.as_str(), "product refreshed from provider");
        }

        self.mark_synced(product_id, &remote_id).await?;
        Ok(Some(product_id))
    }

    /// The remote product is gone. The correlation stays; only the local
    /// bookkeeping forgets the remote side.
    async fn unlink(&self, remote_id: &RemoteId) -> SyncResult<Option<LocalId>> {
        let Some(record) = self
            .correlations
            .find_by_remote(EntityType::Product, remote_id)
            .await?
        else {
            debug!(remote_id = %remote_id, "deleted remote product was never linked");
            return Ok(None);
        };

        let product_id = record.local_id;
        let mut already_unlinked = false;
        let seen = &mut already_unlinked;
        self.repo
            .update_meta(
                EntityType::Product,
                product_id,
                Box::new(move |meta: &mut SyncMeta| {
                    *seen = meta.sync_status == SyncStatus::NotSynced && meta.remote_id.is_none();
                    if !*seen {
                        meta.sync_status = SyncStatus::NotSynced;
                        meta.remote_id = None;
                        meta.last_error = None;
                    }
                }),
            )
            .await?;
        if already_unlinked {
            return Ok(Some(product_id));
        }
        self.repo
            .add_note(
                EntityType::Product,
                product_id,
                &format!("Fulfillment product {remote_id} was deleted by the provider."),
            )
            .await?;
        info!(product_id = %product_id, remote_id = %remote_id, "product unlinked after remote deletion");
        Ok(Some(product_id))
    }

    async fn mark_synced(&self, product_id: LocalId, remote_id: &RemoteId) -> SyncResult<()> {
        let remote_id = remote_id.clone();
        let now = self.clock.now();
        self.repo
            .update_meta(
                EntityType::Product,
                product_id,
                Box::new(move |meta: &mut SyncMeta| meta.synced(remote_id, now)),
            )
            .await?;
        Ok(())
    }

    async fn resolve_local(
        &self,
        remote_id: &RemoteId,
        snapshot: &RemoteProduct,
    ) -> SyncResult<LocalId> {
        if let Some(record) = self
            .correlations
            .find_by_remote(EntityType::Product, remote_id)
            .await?
        {
            return Ok(record.local_id);
        }

        let external = snapshot
            .external_id()
            .and_then(|id| id.parse::<LocalId>().ok());
        if let Some(local_id) = external {
            if self.repo.load_product(local_id).await?.is_some() {
                self.correlations
                    .insert(EntityType::Product, local_id, remote_id.clone())
                    .await?;
                self.repo
                    .add_note(
                        EntityType::Product,
                        local_id,
                        &format!("Linked to fulfillment product {remote_id}."),
                    )
                    .await?;
                return Ok(local_id);
            }
        }

        self.import(remote_id, snapshot).await
    }

    async fn import(&self, remote_id: &RemoteId, snapshot: &RemoteProduct) -> SyncResult<LocalId> {
        let draft = LocalProduct {
            id: LocalId::new(0),
            title: snapshot.title.clone(),
            description: snapshot.description.clone(),
            status: snapshot.local_status(),
            blueprint_id: snapshot.blueprint_id,
            print_provider_id: snapshot.print_provider_id,
            variants: snapshot
                .variants
                .iter()
                .map(|v| ProductVariant {
                    remote_variant_id: v.id,
                    price: v.price,
                    enabled: v.is_enabled,
                })
                .collect(),
            print_areas: snapshot.print_areas.clone(),
            tags: snapshot.tags.clone(),
        };

        let product_id = self.repo.create_product(draft).await?;
        match self
            .correlations
            .insert(EntityType::Product, product_id, remote_id.clone())
            .await
        {
            Ok(_) => {}
            Err(CorrelationError::Conflict { .. }) => {
                if let Some(record) = self
                    .correlations
                    .find_by_remote(EntityType::Product, remote_id)
                    .await?
                {
                    warn!(
                        remote_id = %remote_id,
                        duplicate = %product_id,
                        kept = %record.local_id,
                        "remote product was imported concurrently"
                    );
                    return Ok(record.local_id);
                }
                return Err(SyncError::permanent(format!(
                    "imported product {product_id} could not be linked to {remote_id}"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.repo
            .add_note(
                EntityType::Product,
                product_id,
                &format!("Imported from fulfillment product {remote_id}."),
            )
            .await?;
        info!(product_id = %product_id, remote_id = %remote_id, "product imported from provider");
        Ok(product_id)
    }
}

fn validate(product: &LocalProduct) -> SyncResult<ProductPayload> {
    if product.title.trim().is_empty() {
        return Err(SyncError::permanent(format!(
            "product {} has no title",
            product.id
        )));
    }
    if product.enabled_variants().next().is_none() {
        return Err(SyncError::permanent(format!(
            "product {} has no enabled variants",
            product.id
        )));
    }
    build_product_payload(product).ok_or_else(|| {
        SyncError::permanent(format!(
            "product {} is not linked to a blueprint and print provider",
            product.id
        ))
    })
}
