//! Local commerce entities as the sync layer sees them.
//!
//! These are projections of whatever the host commerce system stores; the
//! [`EntityRepository`](crate::repository::EntityRepository) maps them in
//! and out of its own storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fulfillsync_core::{LocalId, LocalOrderStatus, LocalProductStatus, RemoteId, SyncStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOrder {
    pub id: LocalId,
    pub status: LocalOrderStatus,
    /// Local shipping method identifier, e.g. `flat_rate` or `express`.
    pub shipping_method: String,
    pub shipping: ShippingAddress,
    pub line_items: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Local product the line was bought from, if it still exists.
    pub product_id: Option<LocalId>,
    /// Provider variant chosen for this line.
    pub remote_variant_id: Option<u64>,
    pub quantity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub country: String,
    pub region: String,
    pub address1: String,
    pub address2: String,
    pub city: String,
    pub zip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalProduct {
    pub id: LocalId,
    pub title: String,
    pub description: String,
    pub status: LocalProductStatus,
    pub blueprint_id: Option<u64>,
    pub print_provider_id: Option<u64>,
    pub variants: Vec<ProductVariant>,
    /// Print placement data, passed through to the provider untouched.
    #[serde(default)]
    pub print_areas: JsonValue,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub remote_variant_id: u64,
    /// Price in minor units.
    pub price: u64,
    pub enabled: bool,
}

impl LocalProduct {
    pub fn enabled_variants(&self) -> impl Iterator<Item = &ProductVariant> {
        self.variants.iter().filter(|v| v.enabled)
    }
}

/// Shipment tracking reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracking {
    pub carrier: String,
    pub number: String,
    pub url: Option<String>,
}

/// Sync bookkeeping stored alongside each local entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub sync_status: SyncStatus,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Remote id as last known to this entity. Cleared when the remote side
    /// is deleted; the correlation record itself is never touched.
    pub remote_id: Option<RemoteId>,
    pub tracking: Option<Tracking>,
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            sync_status: SyncStatus::NotSynced,
            last_error: None,
            last_synced_at: None,
            remote_id: None,
            tracking: None,
        }
    }
}

impl SyncMeta {
    pub fn synced(&mut self, remote_id: RemoteId, at: DateTime<Utc>) {
        self.sync_status = SyncStatus::Synced;
        self.last_error = None;
        self.last_synced_at = Some(at);
        self.remote_id = Some(remote_id);
    }

    pub fn failed(&mut self, error: impl Into<String>) {
        self.sync_status = SyncStatus::Failed;
        self.last_error = Some(error.into());
    }
}
