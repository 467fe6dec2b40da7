//! `fulfillsync-core`: shared building blocks for the sync subsystem.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the error taxonomy every job handler reports in, and the
//! status-mapping tables between the local and remote vocabularies.

pub mod error;
pub mod id;
pub mod status;

pub use error::{ErrorKind, SyncError, SyncResult};
pub use id::{EntityKey, EntityType, LocalId, RemoteId};
pub use status::{
    LocalOrderStatus, LocalProductStatus, OrderSyncAction, RemoteShippingMethod, SyncStatus,
    map_remote_order_status, map_remote_product_status, map_shipping_method, order_sync_action,
};
