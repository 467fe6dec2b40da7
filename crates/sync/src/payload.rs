//! Outbound request bodies.
//!
//! Builders are pure: the same local entity always yields the same payload,
//! byte for byte, so retries and updates never drift.

use serde::Serialize;
use serde_json::Value as JsonValue;

use fulfillsync_core::{RemoteId, map_shipping_method};

use crate::model::{LocalOrder, LocalProduct, ShippingAddress};

/// An order line that can be fulfilled remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleLine {
    pub remote_product_id: RemoteId,
    pub variant_id: u64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPayload {
    pub external_id: String,
    pub label: String,
    pub line_items: Vec<OrderLinePayload>,
    pub shipping_method: u8,
    pub send_shipping_notification: bool,
    pub address_to: AddressPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderLinePayload {
    pub product_id: String,
    pub variant_id: u64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressPayload {
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

impl From<&ShippingAddress> for AddressPayload {
    fn from(a: &ShippingAddress) -> Self {
        Self {
            first_name: a.first_name.clone(),
            last_name: a.last_name.clone(),
            email: a.email.clone(),
            phone: a.phone.clone(),
            country: a.country.to_ascii_uppercase(),
            region: a.region.clone(),
            address1: a.address1.clone(),
            address2: a.address2.clone(),
            city: a.city.clone(),
            zip: a.zip.clone(),
        }
    }
}

pub fn build_order_payload(order: &LocalOrder, lines: &[EligibleLine]) -> OrderPayload {
    OrderPayload {
        external_id: order.id.to_string(),
        label: format!("Order #{}", order.id),
        line_items: lines
            .iter()
            .map(|line| OrderLinePayload {
                product_id: line.remote_product_id.to_string(),
                variant_id: line.variant_id,
                quantity: line.quantity,
            })
            .collect(),
        shipping_method: map_shipping_method(&order.shipping_method).code(),
        send_shipping_notification: false,
        address_to: AddressPayload::from(&order.shipping),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductPayload {
    pub title: String,
    pub description: String,
    pub blueprint_id: u64,
    pub print_provider_id: u64,
    pub variants: Vec<VariantPayload>,
    pub print_areas: JsonValue,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantPayload {
    pub id: u64,
    pub price: u64,
    pub is_enabled: bool,
}

/// `None` when the product lacks a blueprint or print provider.
pub fn build_product_payload(product: &LocalProduct) -> Option<ProductPayload> {
    let mut variants: Vec<VariantPayload> = product
        .variants
        .iter()
        .map(|v| VariantPayload {
            id: v.remote_variant_id,
            price: v.price,
            is_enabled: v.enabled,
        })
        .collect();
    variants.sort_by_key(|v| v.id);

    let mut tags = product.tags.clone();
    tags.sort();
    tags.dedup();

    Some(ProductPayload {
        title: product.title.trim().to_string(),
        description: product.description.clone(),
        blueprint_id: product.blueprint_id?,
        print_provider_id: product.print_provider_id?,
        variants,
        print_areas: match &product.print_areas {
            JsonValue::Null => JsonValue::Array(vec![]),
            other => other.clone(),
        },
        tags,
    })
}

/// Body for the provider's publish call: let the provider push every field.
pub fn publish_payload() -> JsonValue {
    serde_json::json!({
        "title": true,
        "description": true,
        "images": true,
        "variants": true,
        "tags": true,
    })
}

/// Body for reporting a finished publication back to the provider.
pub fn publishing_succeeded_payload(product: &LocalProduct) -> JsonValue {
    serde_json::json!({
        "external": {
            "id": product.id.to_string(),
            "handle": format!("products/{}", product.id),
        }
    })
}

#[cfg(test)]
mod tests {
    use fulfillsync_core::{LocalId, LocalOrderStatus, LocalProductStatus};
    use serde_json::json;

    use super::*;
    use crate::model::ProductVariant;

    fn order() -> LocalOrder {
        LocalOrder {
            id: LocalId::new(42),
            status: LocalOrderStatus::Processing,
            shipping_method: "express_shipping:2".to_string(),
            shipping: ShippingAddress {
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
                country: "gb".to_string(),
                ..ShippingAddress::default()
            },
            line_items: vec![],
        }
    }

    #[test]
    fn order_payload_uses_local_id_and_mapped_shipping() {
        let lines = vec![EligibleLine {
            remote_product_id: RemoteId::from("prod-1"),
            variant_id: 17,
            quantity: 2,
        }];
        let payload = build_order_payload(&order(), &lines);
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(value["external_id"], "42");
        assert_eq!(value["shipping_method"], 3);
        assert_eq!(value["address_to"]["country"], "GB");
        assert_eq!(
            value["line_items"],
            json!([{"product_id": "prod-1", "variant_id": 17, "quantity": 2}])
        );
    }

    #[test]
    fn product_payload_is_order_independent() {
        let mut product = LocalProduct {
            id: LocalId::new(7),
            title: " Tee ".to_string(),
            description: String::new(),
            status: LocalProductStatus::Draft,
            blueprint_id: Some(6),
            print_provider_id: Some(99),
            variants: vec![
                ProductVariant { remote_variant_id: 2, price: 1500, enabled: true },
                ProductVariant { remote_variant_id: 1, price: 1400, enabled: false },
            ],
            print_areas: JsonValue::Null,
            tags: vec!["b".to_string(), "a".to_string()],
        };
        let first = serde_json::to_string(&build_product_payload(&product).unwrap()).unwrap();
        product.variants.reverse();
        product.tags.reverse();
        let second = serde_json::to_string(&build_product_payload(&product).unwrap()).unwrap();

        assert_eq!(first, second);
        assert!(first.contains(r#""title":"Tee""#));
        assert!(first.contains(r#""print_areas":[]"#));
    }

    #[test]
    fn product_without_blueprint_has_no_payload() {
        let product = LocalProduct {
            id: LocalId::new(7),
            title: "Tee".to_string(),
            description: String::new(),
            status: LocalProductStatus::Draft,
            blueprint_id: None,
            print_provider_id: Some(99),
            variants: vec![],
            print_areas: JsonValue::Null,
            tags: vec![],
        };
        assert!(build_product_payload(&product).is_none());
    }
}
