//! Job type → orchestrator dispatch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use fulfillsync_core::{EntityKey, EntityType, LocalId, SyncError, SyncResult};
use fulfillsync_infra::correlation::CorrelationStore;
use fulfillsync_infra::jobs::{Job, JobHandler, JobType};

use crate::model::SyncMeta;
use crate::order::OrderSync;
use crate::product::ProductSync;
use crate::repository::EntityRepository;
use crate::webhook::RefreshJob;

/// Payload of `sync_order` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderJob {
    pub order_id: LocalId,
}

/// Payload of `sync_product` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductJob {
    pub product_id: LocalId,
}

/// Encode the payload of an outbound sync job.
pub fn outbound_payload(entity_type: EntityType, id: LocalId) -> SyncResult<Vec<u8>> {
    let encoded = match entity_type {
        EntityType::Order => serde_json::to_vec(&OrderJob { order_id: id }),
        EntityType::Product => serde_json::to_vec(&ProductJob { product_id: id }),
    };
    encoded.map_err(|e| SyncError::permanent(format!("encode {entity_type} job: {e}")))
}

pub struct SyncJobHandler {
    orders: OrderSync,
    products: ProductSync,
    correlations: Arc<dyn CorrelationStore>,
    repo: Arc<dyn EntityRepository>,
}

impl SyncJobHandler {
    pub fn new(
        orders: OrderSync,
        products: ProductSync,
        correlations: Arc<dyn CorrelationStore>,
        repo: Arc<dyn EntityRepository>,
    ) -> Self {
        Self {
            orders,
            products,
            correlations,
            repo,
        }
    }

    /// Local entity a job is about, if it is known yet.
    async fn local_entity(&self, job: &Job) -> SyncResult<Option<(EntityType, LocalId)>> {
        match self.entity_key(job).await? {
            EntityKey::Local { entity_type, id } => Ok(Some((entity_type, id))),
            EntityKey::Remote { .. } => Ok(None),
        }
    }

    /// Keep the last transient error visible while the job waits for a retry.
    async fn note_transient(&self, job: &Job, error: &SyncError) {
        let Ok(Some((entity_type, id))) = self.local_entity(job).await else {
            return;
        };
        let message = error.message().to_string();
        let result = self
            .repo
            .update_meta(
                entity_type,
                id,
                Box::new(move |meta: &mut SyncMeta| meta.last_error = Some(message)),
            )
            .await;
        if let Err(e) = result {
            warn!(entity_type = %entity_type, id = %id, error = %e, "failed to record sync error");
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for SyncJobHandler {
    /// Refreshes of a remote entity with no correlation yet are keyed by the
    /// remote id, so one may overlap an outbound sync of the same local
    /// entity while that sync is creating the link. The refresh then
    /// resolves the entity by `external_id` and the correlation insert is
    /// idempotent for the same pair, so both converge on one link.
    async fn entity_key(&self, job: &Job) -> Result<EntityKey, SyncError> {
        match job.job_type {
            JobType::SyncOrder => {
                let payload: OrderJob = job.payload_as()?;
                Ok(EntityKey::local(EntityType::Order, payload.order_id))
            }
            JobType::SyncProduct => {
                let payload: ProductJob = job.payload_as()?;
                Ok(EntityKey::local(EntityType::Product, payload.product_id))
            }
            JobType::RefreshOrder | JobType::RefreshProduct => {
                let payload: RefreshJob = job.payload_as()?;
                let entity_type = payload.topic.entity_type();
                let linked = self
                    .correlations
                    .find_by_remote(entity_type, &payload.remote_id)
                    .await?;
                Ok(match linked {
                    Some(record) => EntityKey::local(entity_type, record.local_id),
                    None => EntityKey::remote(entity_type, payload.remote_id),
                })
            }
        }
    }

    async fn handle(&self, job: &Job) -> Result<(), SyncError> {
        let result = match job.job_type {
            JobType::SyncOrder => {
                let payload: OrderJob = job.payload_as()?;
                self.orders.sync_outbound(payload.order_id).await
            }
            JobType::SyncProduct => {
                let payload: ProductJob = job.payload_as()?;
                self.products.sync_outbound(payload.product_id).await
            }
            JobType::RefreshOrder => {
                let payload: RefreshJob = job.payload_as()?;
                self.orders
                    .refresh(&payload.remote_id, payload.topic)
                    .await
                    .map(|_| ())
            }
            JobType::RefreshProduct => {
                let payload: RefreshJob = job.payload_as()?;
                self.products
                    .refresh(&payload.remote_id, payload.topic)
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = &result {
            if e.is_retryable() {
                self.note_transient(job, e).await;
            }
        }
        result
    }

    async fn on_terminal_failure(&self, job: &Job, error: &SyncError) {
        let entity = match self.local_entity(job).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                warn!(job_id = %job.id, error = %error, "sync failed for an unlinked remote entity");
                return;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "cannot resolve the entity of a failed job");
                return;
            }
        };
        let (entity_type, id) = entity;

        let result = async {
            let message = error.message().to_string();
            self.repo
                .update_meta(
                    entity_type,
                    id,
                    Box::new(move |meta: &mut SyncMeta| meta.failed(message)),
                )
                .await?;
            self.repo
                .add_note(
                    entity_type,
                    id,
                    &format!("Fulfillment sync failed: {}", error.message()),
                )
                .await
        }
        .await;
        if let Err(e) = result {
            warn!(entity_type = %entity_type, id = %id, error = %e, "failed to mark entity as failed");
        }
    }
}

