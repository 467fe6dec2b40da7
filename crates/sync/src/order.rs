//! Order synchronization.
//!
//! Outbound: local order → remote create / update / cancel.
//! Inbound: remote snapshot → local status, tracking and notes.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use fulfillsync_core::{
    EntityType, LocalId, OrderSyncAction, RemoteId, RemoteShippingMethod, SyncError, SyncResult,
    order_sync_action,
};
use fulfillsync_infra::clock::Clock;
use fulfillsync_infra::correlation::{CorrelationError, CorrelationStore};

use crate::model::{LocalOrder, OrderLine, ShippingAddress, SyncMeta};
use crate::payload::{EligibleLine, OrderPayload, build_order_payload};
use crate::remote::{ProviderApi, RemoteOrder};
use crate::repository::EntityRepository;
use crate::webhook::WebhookTopic;

pub struct OrderSync {
    repo: Arc<dyn EntityRepository>,
    correlations: Arc<dyn CorrelationStore>,
    api: ProviderApi,
    clock: Arc<dyn Clock>,
    send_to_production: bool,
}

impl OrderSync {
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
            send_to_production: false,
        }
    }

    /// Release newly created remote orders to production right away.
    pub fn with_send_to_production(mut self, enabled: bool) -> Self {
        self.send_to_production = enabled;
        self
    }

    /// Push a local order to the provider.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn sync_outbound(&self, order_id: LocalId) -> SyncResult<()> {
        let order = self
            .repo
            .load_order(order_id)
            .await?
            .ok_or_else(|| SyncError::permanent(format!("order {order_id} not found")))?;
        let existing = self
            .correlations
            .find_by_local(EntityType::Order, order_id)
            .await?
            .map(|record| record.remote_id);

        match order_sync_action(order.status) {
            OrderSyncAction::Submit => self.submit(&order, existing).await,
            OrderSyncAction::Cancel => self.cancel(&order, existing).await,
            OrderSyncAction::Skip => Err(SyncError::permanent(format!(
                "order {order_id} is {} and cannot be sent for fulfillment",
                order.status
            ))),
        }
    }

    async fn submit(&self, order: &LocalOrder, existing: Option<RemoteId>) -> SyncResult<()> {
        let lines = self.eligible_lines(order).await?;
        if lines.is_empty() {
            return Err(SyncError::permanent(format!(
                "order {} has no line items linked to provider products",
                order.id
            )));
        }
        let payload = build_order_payload(order, &lines);

        let (remote_id, note) = match existing {
            Some(remote_id) => {
                self.api.update_order(&remote_id, &payload).await?;
                let note = format!("Fulfillment order {remote_id} updated.");
                (remote_id, note)
            }
            None => {
                let created = self.api.create_order(&payload).await?;
                let remote_id = self.link_created(order.id, created, &payload).await?;
                if self.send_to_production {
                    self.api.send_to_production(&remote_id).await?;
                }
                let note = if self.send_to_production {
                    format!("Fulfillment order {remote_id} created and sent to production.")
                } else {
                    format!("Fulfillment order {remote_id} created.")
                };
                (remote_id, note)
            }
        };

        self.mark_synced(order.id, &remote_id).await?;
        self.repo.add_note(EntityType::Order, order.id, &note).await?;

        info!(order_id = %order.id, remote_id = %remote_id, lines = lines.len(), "order synced");
        Ok(())
    }

    /// Persist the link for a freshly created remote order. If another
    /// worker linked this order first, its link wins and the order is
    /// pushed to that remote id instead.
    async fn link_created(
        &self,
        order_id: LocalId,
        created: RemoteId,
        payload: &OrderPayload,
    ) -> SyncResult<RemoteId> {
        match self
            .correlations
            .insert(EntityType::Order, order_id, created.clone())
            .await
        {
            Ok(insert) => Ok(insert.into_record().remote_id),
            Err(conflict @ CorrelationError::Conflict { .. }) => {
                let Some(winner) = self
                    .correlations
                    .find_by_local(EntityType::Order, order_id)
                    .await?
                else {
                    return Err(conflict.into());
                };
                warn!(
                    order_id = %order_id,
                    orphaned = %created,
                    kept = %winner.remote_id,
                    "lost correlation race, updating the linked remote order"
                );
                self.api.update_order(&winner.remote_id, payload).await?;
                Ok(winner.remote_id)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cancel(&self, order: &LocalOrder, existing: Option<RemoteId>) -> SyncResult<()> {
        let Some(remote_id) = existing else {
            debug!(order_id = %order.id, "order was never sent, nothing to cancel");
            return Ok(());
        };

        self.api.cancel_order(&remote_id).await?;

        self.mark_synced(order.id, &remote_id).await?;
        self.repo
            .add_note(
                EntityType::Order,
                order.id,
                &format!("Fulfillment order {remote_id} cancelled."),
            )
            .await?;
        info!(order_id = %order.id, remote_id = %remote_id, "remote order cancelled");
        Ok(())
    }

    /// Lines with a linked product, a provider variant and a quantity.
    async fn eligible_lines(&self, order: &LocalOrder) -> SyncResult<Vec<EligibleLine>> {
        let mut lines = Vec::with_capacity(order.line_items.len());
        for line in &order.line_items {
            let (Some(product_id), Some(variant_id)) = (line.product_id, line.remote_variant_id)
            else {
                continue;
            };
            if line.quantity == 0 {
                continue;
            }
            let Some(product) = self
                .correlations
                .find_by_local(EntityType::Product, product_id)
                .await?
            else {
                debug!(order_id = %order.id, product_id = %product_id, "line product not linked, skipping");
                continue;
            };
            lines.push(EligibleLine {
                remote_product_id: product.remote_id,
                variant_id,
                quantity: line.quantity,
            });
        }
        Ok(lines)
    }

    /// Apply the provider's current view of an order locally.
    #[instrument(skip(self), fields(remote_id = %remote_id, topic = %topic), err)]
    pub async fn refresh(&self, remote_id: &RemoteId, topic: WebhookTopic) -> SyncResult<LocalId> {
        let snapshot = self.api.get_order(remote_id).await?;
        let order_id = self.resolve_local(remote_id, &snapshot).await?;
        let mut order = self.repo.load_order(order_id).await?.ok_or_else(|| {
            SyncError::permanent(format!(
                "order {order_id} linked to remote {remote_id} no longer exists"
            ))
        })?;

        let mut changes = Vec::new();

        let status = snapshot.local_status();
        if order.status != status {
            changes.push(format!("status {} -> {}", order.status, status));
            order.status = status;
            self.repo.save_order(&order).await?;
        }

        let tracking = snapshot.latest_tracking();
        let synced_id = remote_id.clone();
        let now = self.clock.now();
        let mut tracking_change = None;
        let change = &mut tracking_change;
        self.repo
            .update_meta(
                EntityType::Order,
                order_id,
                Box::new(move |meta: &mut SyncMeta| {
                    if let Some(tracking) = tracking {
                        if meta.tracking.as_ref() != Some(&tracking) {
                            *change =
                                Some(format!("tracking {} {}", tracking.carrier, tracking.number));
                            meta.tracking = Some(tracking);
                        }
                    }
                    meta.synced(synced_id, now);
                }),
            )
            .await?;
        changes.extend(tracking_change);

        if !changes.is_empty() {
            let note = format!("Fulfillment update ({topic}): {}.", changes.join(", "));
            self.repo.add_note(EntityType::Order, order_id, &note).await?;
            info!(order_id = %order_id, changes = changes.len(), "order refreshed from provider");
        } else {
            debug!(order_id = %order_id, "order already up to date");
        }
        Ok(order_id)
    }

    async fn mark_synced(&self, order_id: LocalId, remote_id: &RemoteId) -> SyncResult<()> {
        let remote_id = remote_id.clone();
        let now = self.clock.now();
        self.repo
            .update_meta(
                EntityType::Order,
                order_id,
                Box::new(move |meta: &mut SyncMeta| meta.synced(remote_id, now)),
            )
            .await?;
        Ok(())
    }

    /// Correlation first, then the snapshot's `external_id`, then import.
    async fn resolve_local(&self, remote_id: &RemoteId, snapshot: &RemoteOrder) -> SyncResult<LocalId> {
        if let Some(record) = self
            .correlations
            .find_by_remote(EntityType::Order, remote_id)
            .await?
        {
            return Ok(record.local_id);
        }

        if let Some(local_id) = self.external_order(snapshot).await? {
            self.correlations
                .insert(EntityType::Order, local_id, remote_id.clone())
                .await?;
            self.repo
                .add_note(
                    EntityType::Order,
                    local_id,
                    &format!("Linked to fulfillment order {remote_id}."),
                )
                .await?;
            info!(order_id = %local_id, remote_id = %remote_id, "order linked by external id");
            return Ok(local_id);
        }

        self.import(remote_id, snapshot).await
    }

    async fn external_order(&self, snapshot: &RemoteOrder) -> SyncResult<Option<LocalId>> {
        let Some(local_id) = snapshot
            .external_id
            .as_deref()
            .and_then(|id| id.parse::<LocalId>().ok())
        else {
            return Ok(None);
        };
        Ok(self.repo.load_order(local_id).await?.map(|_| local_id))
    }

    async fn import(&self, remote_id: &RemoteId, snapshot: &RemoteOrder) -> SyncResult<LocalId> {
        let mut line_items = Vec::with_capacity(snapshot.line_items.len());
        for line in &snapshot.line_items {
            let product_id = match line.product_id.as_deref() {
                Some(pid) => self
                    .correlations
                    .find_by_remote(EntityType::Product, &RemoteId::from(pid))
                    .await?
                    .map(|record| record.local_id),
                None => None,
            };
            line_items.push(OrderLine {
                product_id,
                remote_variant_id: line.variant_id,
                quantity: line.quantity,
            });
        }

        let shipping_method = snapshot
            .shipping_method
            .and_then(RemoteShippingMethod::from_code)
            .unwrap_or(RemoteShippingMethod::Standard);
        let draft = LocalOrder {
            id: LocalId::new(0),
            status: snapshot.local_status(),
            shipping_method: shipping_method.as_str().to_string(),
            shipping: snapshot
                .address_to
                .as_ref()
                .map(|a| ShippingAddress {
                    first_name: a.first_name.clone(),
                    last_name: a.last_name.clone(),
                    email: a.email.clone(),
                    phone: a.phone.clone(),
                    country: a.country.clone(),
                    region: a.region.clone(),
                    address1: a.address1.clone(),
                    address2: a.address2.clone(),
                    city: a.city.clone(),
                    zip: a.zip.clone(),
                })
                .unwrap_or_default(),
            line_items,
        };

        let order_id = self.repo.create_order(draft).await?;
        match self
            .correlations
            .insert(EntityType::Order, order_id, remote_id.clone())
            .await
        {
            Ok(_) => {}
            Err(CorrelationError::Conflict { .. }) => {
                if let Some(record) = self
                    .correlations
                    .find_by_remote(EntityType::Order, remote_id)
                    .await?
                {
                    warn!(
                        remote_id = %remote_id,
                        duplicate = %order_id,
                        kept = %record.local_id,
                        "remote order was imported concurrently"
                    );
                    return Ok(record.local_id);
                }
                return Err(SyncError::permanent(format!(
                    "imported order {order_id} could not be linked to {remote_id}"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.repo
            .add_note(
                EntityType::Order,
                order_id,
                &format!("Imported from fulfillment order {remote_id}."),
            )
            .await?;
        info!(order_id = %order_id, remote_id = %remote_id, "order imported from provider");
        Ok(order_id)
    }
}
