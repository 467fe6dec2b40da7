//! `fulfillsync-sync`: order and product synchronization with the
//! fulfillment provider.
//!
//! - `order`, `product`: outbound and inbound orchestrators
//! - `handler`: maps queued jobs onto the orchestrators
//! - `webhook`: signature verification and ingress
//! - `service`: entry points for the rest of the system

pub mod handler;
pub mod model;
pub mod order;
pub mod payload;
pub mod product;
pub mod remote;
pub mod repository;
pub mod service;
pub mod webhook;

#[cfg(test)]
mod test_support;

pub use handler::{OrderJob, ProductJob, SyncJobHandler};
pub use model::{LocalOrder, LocalProduct, OrderLine, ProductVariant, ShippingAddress, SyncMeta, Tracking};
pub use order::OrderSync;
pub use product::ProductSync;
pub use remote::ProviderApi;
pub use repository::{EntityRepository, InMemoryEntityRepository, MetaUpdate, RepositoryError};
pub use service::{SyncService, SyncStatusView};
pub use webhook::{
    RefreshJob, Rejection, SIGNATURE_HEADER, WebhookIngress, WebhookOutcome, WebhookTopic, verify,
};
