//! Status mapping between the local and remote vocabularies.
//!
//! Every mapping here is a pure, total function backed by a static table.
//! Unknown remote values fall back to a safe default and log a warning; they
//! are never an error.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Order status in the local commerce system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocalOrderStatus {
    Pending,
    Processing,
    OnHold,
    Completed,
    Cancelled,
    Refunded,
    Failed,
}

impl LocalOrderStatus {
    pub const ALL: [LocalOrderStatus; 7] = [
        LocalOrderStatus::Pending,
        LocalOrderStatus::Processing,
        LocalOrderStatus::OnHold,
        LocalOrderStatus::Completed,
        LocalOrderStatus::Cancelled,
        LocalOrderStatus::Refunded,
        LocalOrderStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocalOrderStatus::Pending => "pending",
            LocalOrderStatus::Processing => "processing",
            LocalOrderStatus::OnHold => "on-hold",
            LocalOrderStatus::Completed => "completed",
            LocalOrderStatus::Cancelled => "cancelled",
            LocalOrderStatus::Refunded => "refunded",
            LocalOrderStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for LocalOrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalOrderStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().trim_start_matches("wc-");
        LocalOrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| SyncError::permanent(format!("unknown local order status: {s}")))
    }
}

/// What an outbound order sync should do for a given local status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OrderSyncAction {
    /// Create (or update) the order remotely.
    Submit,
    /// Cancel the remote counterpart.
    Cancel,
    /// The order is not in a syncable state.
    Skip,
}

/// Publication status of a local product.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalProductStatus {
    Publish,
    Pending,
    Draft,
}

impl LocalProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalProductStatus::Publish => "publish",
            LocalProductStatus::Pending => "pending",
            LocalProductStatus::Draft => "draft",
        }
    }
}

/// Per-entity synchronization state surfaced to the rest of the system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    NotSynced,
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::NotSynced => "not_synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_synced" => Ok(SyncStatus::NotSynced),
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(SyncError::permanent(format!("unknown sync status: {other}"))),
        }
    }
}

/// Shipping method identifiers understood by the provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteShippingMethod {
    Standard,
    Priority,
    Express,
    Economy,
}

impl RemoteShippingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteShippingMethod::Standard => "standard",
            RemoteShippingMethod::Priority => "priority",
            RemoteShippingMethod::Express => "express",
            RemoteShippingMethod::Economy => "economy",
        }
    }

    /// Numeric code sent on the wire.
    pub fn code(&self) -> u8 {
        match self {
            RemoteShippingMethod::Standard => 1,
            RemoteShippingMethod::Priority => 2,
            RemoteShippingMethod::Express => 3,
            RemoteShippingMethod::Economy => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RemoteShippingMethod::Standard),
            2 => Some(RemoteShippingMethod::Priority),
            3 => Some(RemoteShippingMethod::Express),
            4 => Some(RemoteShippingMethod::Economy),
            _ => None,
        }
    }
}

const REMOTE_ORDER_STATUSES: &[(&str, LocalOrderStatus)] = &[
    ("pending", LocalOrderStatus::Processing),
    ("sending_to_production", LocalOrderStatus::Processing),
    ("in_production", LocalOrderStatus::Processing),
    ("partially_fulfilled", LocalOrderStatus::Processing),
    ("on_hold", LocalOrderStatus::OnHold),
    ("has_issues", LocalOrderStatus::OnHold),
    ("payment_not_received", LocalOrderStatus::OnHold),
    ("fulfilled", LocalOrderStatus::Completed),
    ("shipped", LocalOrderStatus::Completed),
    ("delivered", LocalOrderStatus::Completed),
    ("canceled", LocalOrderStatus::Cancelled),
    ("cancelled", LocalOrderStatus::Cancelled),
    ("refunded", LocalOrderStatus::Refunded),
];

const REMOTE_PRODUCT_STATUSES: &[(&str, LocalProductStatus)] = &[
    ("published", LocalProductStatus::Publish),
    ("visible", LocalProductStatus::Publish),
    ("publishing", LocalProductStatus::Pending),
    ("unpublished", LocalProductStatus::Draft),
    ("hidden", LocalProductStatus::Draft),
    ("draft", LocalProductStatus::Draft),
];

const SHIPPING_METHODS: &[(&str, RemoteShippingMethod)] = &[
    ("flat_rate", RemoteShippingMethod::Standard),
    ("free_shipping", RemoteShippingMethod::Standard),
    ("standard", RemoteShippingMethod::Standard),
    ("priority", RemoteShippingMethod::Priority),
    ("priority_mail", RemoteShippingMethod::Priority),
    ("express", RemoteShippingMethod::Express),
    ("express_shipping", RemoteShippingMethod::Express),
    ("next_day", RemoteShippingMethod::Express),
    ("economy", RemoteShippingMethod::Economy),
];

/// Fallback for unknown remote order statuses.
pub const DEFAULT_LOCAL_ORDER_STATUS: LocalOrderStatus = LocalOrderStatus::Processing;

/// Fallback for unknown remote product statuses.
pub const DEFAULT_LOCAL_PRODUCT_STATUS: LocalProductStatus = LocalProductStatus::Draft;

/// Fallback for unknown local shipping methods.
pub const DEFAULT_SHIPPING_METHOD: RemoteShippingMethod = RemoteShippingMethod::Standard;

/// Lowercase, trim, and fold `-` and spaces into `_`.
fn normalize(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

fn lookup<T: Copy>(table: &[(&str, T)], key: &str) -> Option<T> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Exact table lookup for a remote order status, without the fallback.
pub fn lookup_remote_order_status(remote: &str) -> Option<LocalOrderStatus> {
    lookup(REMOTE_ORDER_STATUSES, &normalize(remote))
}

/// Map a remote order status to the local vocabulary.
pub fn map_remote_order_status(remote: &str) -> LocalOrderStatus {
    lookup_remote_order_status(remote).unwrap_or_else(|| {
        tracing::warn!(
            remote_status = remote,
            fallback = DEFAULT_LOCAL_ORDER_STATUS.as_str(),
            "unmapped remote order status"
        );
        DEFAULT_LOCAL_ORDER_STATUS
    })
}

/// Decide what outbound sync does for a local order status.
pub fn order_sync_action(local: LocalOrderStatus) -> OrderSyncAction {
    match local {
        LocalOrderStatus::Processing | LocalOrderStatus::Completed => OrderSyncAction::Submit,
        LocalOrderStatus::Cancelled | LocalOrderStatus::Refunded => OrderSyncAction::Cancel,
        LocalOrderStatus::Pending | LocalOrderStatus::OnHold | LocalOrderStatus::Failed => {
            OrderSyncAction::Skip
        }
    }
}

/// Map a remote product publication status to the local vocabulary.
pub fn map_remote_product_status(remote: &str) -> LocalProductStatus {
    lookup(REMOTE_PRODUCT_STATUSES, &normalize(remote)).unwrap_or_else(|| {
        tracing::warn!(
            remote_status = remote,
            fallback = DEFAULT_LOCAL_PRODUCT_STATUS.as_str(),
            "unmapped remote product status"
        );
        DEFAULT_LOCAL_PRODUCT_STATUS
    })
}

/// Map a local shipping method identifier to the provider's method.
///
/// Local identifiers may carry an instance suffix (`flat_rate:3`); only the
/// method part is looked up.
pub fn map_shipping_method(local_method: &str) -> RemoteShippingMethod {
    let method = local_method.split(':').next().unwrap_or_default();
    lookup(SHIPPING_METHODS, &normalize(method)).unwrap_or(DEFAULT_SHIPPING_METHOD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn remote_order_statuses_map_per_table() {
        let cases = [
            ("in_production", LocalOrderStatus::Processing),
            ("in-production", LocalOrderStatus::Processing),
            ("Sending-To-Production", LocalOrderStatus::Processing),
            ("canceled", LocalOrderStatus::Cancelled),
            ("shipped", LocalOrderStatus::Completed),
            ("delivered", LocalOrderStatus::Completed),
            ("fulfilled", LocalOrderStatus::Completed),
            ("on-hold", LocalOrderStatus::OnHold),
            ("has-issues", LocalOrderStatus::OnHold),
            ("refunded", LocalOrderStatus::Refunded),
        ];

        for (remote, expected) in cases {
            assert_eq!(map_remote_order_status(remote), expected, "remote={remote}");
        }
    }

    #[test]
    fn unknown_remote_order_status_falls_back_to_processing() {
        assert_eq!(lookup_remote_order_status("teleported"), None);
        assert_eq!(map_remote_order_status("teleported"), LocalOrderStatus::Processing);
        assert_eq!(map_remote_order_status(""), LocalOrderStatus::Processing);
    }

    #[test]
    fn order_actions_cover_every_local_status() {
        for status in LocalOrderStatus::ALL {
            let action = order_sync_action(status);
            let expected = match status.as_str() {
                "processing" | "completed" => OrderSyncAction::Submit,
                "cancelled" | "refunded" => OrderSyncAction::Cancel,
                _ => OrderSyncAction::Skip,
            };
            assert_eq!(action, expected, "status={status}");
        }
    }

    #[test]
    fn product_statuses_map_with_draft_fallback() {
        assert_eq!(map_remote_product_status("published"), LocalProductStatus::Publish);
        assert_eq!(map_remote_product_status("Publishing"), LocalProductStatus::Pending);
        assert_eq!(map_remote_product_status("unpublished"), LocalProductStatus::Draft);
        assert_eq!(map_remote_product_status("archived"), LocalProductStatus::Draft);
    }

    #[test]
    fn shipping_methods_strip_instance_suffix_and_default_to_standard() {
        assert_eq!(map_shipping_method("flat_rate:3"), RemoteShippingMethod::Standard);
        assert_eq!(map_shipping_method("express"), RemoteShippingMethod::Express);
        assert_eq!(map_shipping_method("Priority-Mail"), RemoteShippingMethod::Priority);
        assert_eq!(map_shipping_method("economy:1"), RemoteShippingMethod::Economy);
        assert_eq!(map_shipping_method("carrier_pigeon"), RemoteShippingMethod::Standard);
        assert_eq!(map_shipping_method(""), RemoteShippingMethod::Standard);
        assert_eq!(RemoteShippingMethod::Express.code(), 3);
    }

    #[test]
    fn local_order_status_round_trips_through_strings() {
        for status in LocalOrderStatus::ALL {
            assert_eq!(status.as_str().parse::<LocalOrderStatus>().unwrap(), status);
        }
        assert_eq!("wc-on-hold".parse::<LocalOrderStatus>().unwrap(), LocalOrderStatus::OnHold);
    }

    proptest! {
        #[test]
        fn remote_order_mapping_is_total_and_deterministic(s in ".*") {
            let first = map_remote_order_status(&s);
            let second = map_remote_order_status(&s);
            prop_assert_eq!(first, second);
            prop_assert!(LocalOrderStatus::ALL.contains(&first));
        }

        #[test]
        fn product_and_shipping_mappings_are_deterministic(s in "[a-zA-Z_: -]{0,24}") {
            prop_assert_eq!(map_remote_product_status(&s), map_remote_product_status(&s));
            prop_assert_eq!(map_shipping_method(&s), map_shipping_method(&s));
        }
    }
}
