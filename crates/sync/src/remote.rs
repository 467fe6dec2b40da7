//! Typed facade over the provider API.
//!
//! Turns [`ApiResponse`]s into [`SyncError`]s: 429, 5xx and missing
//! responses are transient; every other failure status is permanent.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;

use fulfillsync_core::{
    LocalOrderStatus, LocalProductStatus, RemoteId, SyncError, SyncResult,
    map_remote_order_status, map_remote_product_status,
};
use fulfillsync_infra::client::{ApiResponse, ApiTransport};

use crate::model::Tracking;
use crate::payload::{self, OrderPayload, ProductPayload};

/// Remote order as returned by `GET shops/{shop}/orders/{id}.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteOrder {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub address_to: Option<RemoteAddress>,
    #[serde(default)]
    pub line_items: Vec<RemoteLineItem>,
    #[serde(default)]
    pub shipments: Vec<RemoteShipment>,
    #[serde(default)]
    pub shipping_method: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteAddress {
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

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteLineItem {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub variant_id: Option<u64>,
    #[serde(default)]
    pub quantity: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteShipment {
    pub carrier: String,
    pub number: String,
    pub url: Option<String>,
    pub delivered_at: Option<String>,
}

impl RemoteOrder {
    pub fn remote_id(&self) -> RemoteId {
        RemoteId::new(self.id.clone())
    }

    pub fn local_status(&self) -> LocalOrderStatus {
        map_remote_order_status(&self.status)
    }

    /// Most recent shipment that carries a tracking number.
    pub fn latest_tracking(&self) -> Option<Tracking> {
        self.shipments
            .iter()
            .rev()
            .find(|s| !s.number.trim().is_empty())
            .map(|s| Tracking {
                carrier: s.carrier.clone(),
                number: s.number.trim().to_string(),
                url: s.url.clone().filter(|u| !u.is_empty()),
            })
    }
}

/// Remote product as returned by `GET shops/{shop}/products/{id}.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteProduct {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visible: bool,
    /// Explicit publication status, when the provider reports one.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub external: Option<RemoteExternal>,
    #[serde(default)]
    pub blueprint_id: Option<u64>,
    #[serde(default)]
    pub print_provider_id: Option<u64>,
    #[serde(default)]
    pub variants: Vec<RemoteVariant>,
    #[serde(default)]
    pub print_areas: JsonValue,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteExternal {
    #[serde(default, deserialize_with = "opt_id_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteVariant {
    pub id: u64,
    #[serde(default)]
    pub price: u64,
    #[serde(default)]
    pub is_enabled: bool,
}

impl RemoteProduct {
    pub fn remote_id(&self) -> RemoteId {
        RemoteId::new(self.id.clone())
    }

    pub fn remote_status(&self) -> &str {
        match self.status.as_deref() {
            Some(status) => status,
            None if self.visible => "visible",
            None => "hidden",
        }
    }

    pub fn local_status(&self) -> LocalProductStatus {
        map_remote_product_status(self.remote_status())
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external.as_ref()?.id.as_deref()
    }
}

/// Provider operations used by the orchestrators.
#[derive(Clone)]
pub struct ProviderApi {
    transport: Arc<dyn ApiTransport>,
}

impl ProviderApi {
    pub fn new(transport: Arc<dyn ApiTransport>) -> Self {
        Self { transport }
    }

    pub async fn create_order(&self, body: &OrderPayload) -> SyncResult<RemoteId> {
        let body = to_json(body)?;
        let data = self
            .call(Method::POST, "orders.json", Some(&body), "create order")
            .await?;
        created_id(data, "create order")
    }

    pub async fn update_order(&self, remote_id: &RemoteId, body: &OrderPayload) -> SyncResult<()> {
        let body = to_json(body)?;
        self.call(
            Method::PUT,
            &format!("orders/{remote_id}.json"),
            Some(&body),
            "update order",
        )
        .await?;
        Ok(())
    }

    pub async fn cancel_order(&self, remote_id: &RemoteId) -> SyncResult<()> {
        self.call(
            Method::POST,
            &format!("orders/{remote_id}/cancel.json"),
            None,
            "cancel order",
        )
        .await?;
        Ok(())
    }

    pub async fn send_to_production(&self, remote_id: &RemoteId) -> SyncResult<()> {
        self.call(
            Method::POST,
            &format!("orders/{remote_id}/send_to_production.json"),
            None,
            "send order to production",
        )
        .await?;
        Ok(())
    }

    pub async fn get_order(&self, remote_id: &RemoteId) -> SyncResult<RemoteOrder> {
        let data = self
            .call(Method::GET, &format!("orders/{remote_id}.json"), None, "get order")
            .await?;
        snapshot(data, "order")
    }

    pub async fn create_product(&self, body: &ProductPayload) -> SyncResult<RemoteId> {
        let body = to_json(body)?;
        let data = self
            .call(Method::POST, "products.json", Some(&body), "create product")
            .await?;
        created_id(data, "create product")
    }

    pub async fn update_product(
        &self,
        remote_id: &RemoteId,
        body: &ProductPayload,
    ) -> SyncResult<()> {
        let body = to_json(body)?;
        self.call(
            Method::PUT,
            &format!("products/{remote_id}.json"),
            Some(&body),
            "update product",
        )
        .await?;
        Ok(())
    }

    pub async fn get_product(&self, remote_id: &RemoteId) -> SyncResult<RemoteProduct> {
        let data = self
            .call(
                Method::GET,
                &format!("products/{remote_id}.json"),
                None,
                "get product",
            )
            .await?;
        snapshot(data, "product")
    }

    pub async fn publish_product(&self, remote_id: &RemoteId) -> SyncResult<()> {
        self.call(
            Method::POST,
            &format!("products/{remote_id}/publish.json"),
            Some(&payload::publish_payload()),
            "publish product",
        )
        .await?;
        Ok(())
    }

    pub async fn publishing_succeeded(&self, remote_id: &RemoteId, body: &JsonValue) -> SyncResult<()> {
        self.call(
            Method::POST,
            &format!("products/{remote_id}/publishing_succeeded.json"),
            Some(body),
            "report publishing succeeded",
        )
        .await?;
        Ok(())
    }

    async fn call(
        &self,
        method: Method,
        resource: &str,
        body: Option<&JsonValue>,
        what: &str,
    ) -> SyncResult<Option<JsonValue>> {
        let path = self.transport.shop_path(resource)?;
        let response = self.transport.request(method, &path, body).await?;
        classify(response, what)
    }
}

impl std::fmt::Debug for ProviderApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderApi").finish_non_exhaustive()
    }
}

/// Success data, or the failure classified by status.
pub fn classify(response: ApiResponse, what: &str) -> SyncResult<Option<JsonValue>> {
    if response.success {
        return Ok(response.data);
    }

    let detail = response
        .error
        .unwrap_or_else(|| "request failed".to_string());
    let message = format!("{what}: {detail}");
    if let Some(until) = response.retry_at {
        return Err(SyncError::throttled(message, until));
    }
    match response.status {
        None => Err(SyncError::transient(message)),
        Some(429) => Err(SyncError::transient(message)),
        Some(code) if code >= 500 => Err(SyncError::transient(message)),
        Some(_) => Err(SyncError::permanent(message)),
    }
}

fn to_json<T: serde::Serialize>(body: &T) -> SyncResult<JsonValue> {
    serde_json::to_value(body).map_err(|e| SyncError::permanent(format!("encode payload: {e}")))
}

fn created_id(data: Option<JsonValue>, what: &str) -> SyncResult<RemoteId> {
    match data.as_ref().and_then(|d| d.get("id")) {
        Some(JsonValue::String(id)) if !id.is_empty() => Ok(RemoteId::new(id.clone())),
        Some(JsonValue::Number(id)) => Ok(RemoteId::new(id.to_string())),
        _ => Err(SyncError::permanent(format!(
            "{what}: response carried no remote id"
        ))),
    }
}

fn snapshot<T: DeserializeOwned>(data: Option<JsonValue>, kind: &str) -> SyncResult<T> {
    let data = data.ok_or_else(|| SyncError::permanent(format!("empty {kind} snapshot")))?;
    serde_json::from_value(data)
        .map_err(|e| SyncError::permanent(format!("unreadable {kind} snapshot: {e}")))
}

fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or numeric id, got {other}"
        ))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or numeric id, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use fulfillsync_core::ErrorKind;
    use serde_json::json;

    use super::*;
    use crate::test_support::ScriptedTransport;

    #[test]
    fn failures_are_classified_by_status() {
        let cases = [
            (None, ErrorKind::Transient),
            (Some(429), ErrorKind::Transient),
            (Some(500), ErrorKind::Transient),
            (Some(503), ErrorKind::Transient),
            (Some(400), ErrorKind::Permanent),
            (Some(404), ErrorKind::Permanent),
            (Some(422), ErrorKind::Permanent),
        ];
        for (status, kind) in cases {
            let err = classify(ApiResponse::failed(status, "boom"), "get order").unwrap_err();
            assert_eq!(err.kind(), kind, "status {status:?}");
            assert_eq!(err.message(), "get order: boom");
        }
    }

    #[test]
    fn deferred_failures_carry_the_reset_time() {
        let until = chrono::Utc::now() + chrono::Duration::seconds(900);
        let response = ApiResponse::failed(Some(429), "HTTP 429").deferred(until);
        let err = classify(response, "create order").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.retry_not_before(), Some(until));
    }

    #[tokio::test]
    async fn create_order_reads_the_remote_id() {
        let transport = Arc::new(ScriptedTransport::new().route(
            Method::POST,
            "shops/77/orders.json",
            ApiResponse::ok(201, Some(json!({"id": 999}))),
        ));
        let api = ProviderApi::new(transport.clone());

        let body = crate::payload::OrderPayload {
            external_id: "42".to_string(),
            label: "Order #42".to_string(),
            line_items: vec![],
            shipping_method: 1,
            send_shipping_notification: false,
            address_to: crate::payload::AddressPayload::from(&crate::model::ShippingAddress::default()),
        };
        let id = api.create_order(&body).await.unwrap();

        assert_eq!(id, RemoteId::from("999"));
        let calls = transport.calls();
        assert_eq!(calls[0].method, Method::POST);
        assert_eq!(calls[0].path, "shops/77/orders.json");
        assert_eq!(calls[0].body.as_ref().unwrap()["external_id"], "42");
    }

    #[test]
    fn order_snapshot_accepts_numeric_ids_and_missing_fields() {
        let order: RemoteOrder = serde_json::from_value(json!({
            "id": 5,
            "status": "shipped",
            "external_id": 42,
            "shipments": [
                {"carrier": "usps", "number": "", "url": null},
                {"carrier": "ups", "number": " 1Z999 ", "url": "https://t.example/1Z999"}
            ]
        }))
        .unwrap();

        assert_eq!(order.remote_id(), RemoteId::from("5"));
        assert_eq!(order.external_id.as_deref(), Some("42"));
        assert_eq!(order.local_status(), LocalOrderStatus::Completed);
        let tracking = order.latest_tracking().unwrap();
        assert_eq!(tracking.carrier, "ups");
        assert_eq!(tracking.number, "1Z999");
    }

    #[test]
    fn product_status_falls_back_to_visibility() {
        let visible: RemoteProduct =
            serde_json::from_value(json!({"id": "p1", "visible": true})).unwrap();
        let hidden: RemoteProduct = serde_json::from_value(json!({"id": "p2"})).unwrap();
        let publishing: RemoteProduct =
            serde_json::from_value(json!({"id": "p3", "status": "publishing"})).unwrap();

        assert_eq!(visible.local_status(), LocalProductStatus::Publish);
        assert_eq!(hidden.local_status(), LocalProductStatus::Draft);
        assert_eq!(publishing.local_status(), LocalProductStatus::Pending);
    }
}
