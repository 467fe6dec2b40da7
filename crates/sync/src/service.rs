//! Collaborator-facing entry points.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use fulfillsync_core::{EntityType, LocalId, RemoteId, SyncError, SyncResult, SyncStatus};
use fulfillsync_infra::jobs::{Job, JobId, JobStats, JobStatus, JobStore, JobType};

use crate::handler::outbound_payload;
use crate::model::SyncMeta;
use crate::repository::EntityRepository;
use crate::webhook::{self, WebhookIngress, WebhookOutcome, WebhookTopic};

/// What `get_sync_status` reports for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatusView {
    pub entity_type: EntityType,
    pub entity_id: LocalId,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub remote_id: Option<RemoteId>,
}

pub struct SyncService {
    store: Arc<dyn JobStore>,
    repo: Arc<dyn EntityRepository>,
    webhooks: WebhookIngress,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn JobStore>,
        repo: Arc<dyn EntityRepository>,
        webhooks: WebhookIngress,
    ) -> Self {
        Self {
            store,
            repo,
            webhooks,
        }
    }

    pub async fn entity_exists(&self, entity_type: EntityType, entity_id: LocalId) -> SyncResult<bool> {
        Ok(match entity_type {
            EntityType::Order => self.repo.load_order(entity_id).await?.is_some(),
            EntityType::Product => self.repo.load_product(entity_id).await?.is_some(),
        })
    }

    /// Queue an outbound sync for a local entity and mark it pending.
    pub async fn enqueue_sync(&self, entity_type: EntityType, entity_id: LocalId) -> SyncResult<JobId> {
        if !self.entity_exists(entity_type, entity_id).await? {
            return Err(SyncError::permanent(format!(
                "{entity_type} {entity_id} not found"
            )));
        }

        let payload = outbound_payload(entity_type, entity_id)?;
        let job_id = self
            .store
            .enqueue(JobType::outbound(entity_type), payload, None)
            .await?;

        self.repo
            .update_meta(
                entity_type,
                entity_id,
                Box::new(|meta: &mut SyncMeta| meta.sync_status = SyncStatus::Pending),
            )
            .await?;

        info!(entity_type = %entity_type, entity_id = %entity_id, job_id = %job_id, "sync queued");
        Ok(job_id)
    }

    /// Queue the refresh for a provider event that arrived out of band.
    pub async fn on_webhook_event(&self, topic: WebhookTopic, remote_id: RemoteId) -> SyncResult<JobId> {
        webhook::enqueue_refresh(self.store.as_ref(), topic, remote_id).await
    }

    /// Verify and enqueue a raw webhook delivery.
    pub async fn receive_webhook(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> SyncResult<WebhookOutcome> {
        self.webhooks.receive(raw_body, signature_header).await
    }

    pub async fn get_sync_status(
        &self,
        entity_type: EntityType,
        entity_id: LocalId,
    ) -> SyncResult<SyncStatusView> {
        let meta = self.repo.get_meta(entity_type, entity_id).await?;
        Ok(SyncStatusView {
            entity_type,
            entity_id,
            status: meta.sync_status,
            last_error: meta.last_error,
            last_synced_at: meta.last_synced_at,
            remote_id: meta.remote_id,
        })
    }

    pub async fn job_stats(&self) -> SyncResult<JobStats> {
        Ok(self.store.stats().await?)
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> SyncResult<Vec<Job>> {
        Ok(self.store.list(status, limit).await?)
    }

    /// Drop a job that has not been claimed yet. Claimed or finished jobs
    /// are left alone and `false` is returned.
    pub async fn cancel_job(&self, id: JobId) -> SyncResult<bool> {
        let cancelled = self.store.delete_pending(id).await?;
        if cancelled {
            info!(job_id = %id, "pending job cancelled");
        }
        Ok(cancelled)
    }
}
