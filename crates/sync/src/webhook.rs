//! Webhook ingress.
//!
//! ```text
//! Received ──verify──▶ SignatureVerified ──parse + enqueue──▶ Accepted
//!    │                        │
//!    └────────────────────────┴──────────────────────────────▶ Rejected
//! ```
//!
//! A request is accepted only once its refresh job is durably enqueued.
//! Nothing is deduplicated here; redelivered events become separate jobs
//! whose processing is idempotent.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value as JsonValue, json};
use sha2::Sha256;

use fulfillsync_core::{EntityType, RemoteId, SyncError, SyncResult};
use fulfillsync_infra::clock::Clock;
use fulfillsync_infra::credentials::{self, CredentialStore};
use fulfillsync_infra::jobs::{JobId, JobStore, JobType};
use fulfillsync_observability::{LogLevel, LogSink};

type HmacSha256 = Hmac<Sha256>;

/// Request header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Provider events this integration reacts to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookTopic {
    #[serde(rename = "order:created")]
    OrderCreated,
    #[serde(rename = "order:updated")]
    OrderUpdated,
    #[serde(rename = "order:sent-to-production")]
    OrderSentToProduction,
    #[serde(rename = "order:shipment:created")]
    OrderShipmentCreated,
    #[serde(rename = "order:shipment:delivered")]
    OrderShipmentDelivered,
    #[serde(rename = "product:publish:started")]
    ProductPublishStarted,
    #[serde(rename = "product:deleted")]
    ProductDeleted,
}

impl WebhookTopic {
    pub const ALL: [WebhookTopic; 7] = [
        WebhookTopic::OrderCreated,
        WebhookTopic::OrderUpdated,
        WebhookTopic::OrderSentToProduction,
        WebhookTopic::OrderShipmentCreated,
        WebhookTopic::OrderShipmentDelivered,
        WebhookTopic::ProductPublishStarted,
        WebhookTopic::ProductDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookTopic::OrderCreated => "order:created",
            WebhookTopic::OrderUpdated => "order:updated",
            WebhookTopic::OrderSentToProduction => "order:sent-to-production",
            WebhookTopic::OrderShipmentCreated => "order:shipment:created",
            WebhookTopic::OrderShipmentDelivered => "order:shipment:delivered",
            WebhookTopic::ProductPublishStarted => "product:publish:started",
            WebhookTopic::ProductDeleted => "product:deleted",
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            WebhookTopic::OrderCreated
            | WebhookTopic::OrderUpdated
            | WebhookTopic::OrderSentToProduction
            | WebhookTopic::OrderShipmentCreated
            | WebhookTopic::OrderShipmentDelivered => EntityType::Order,
            WebhookTopic::ProductPublishStarted | WebhookTopic::ProductDeleted => {
                EntityType::Product
            }
        }
    }

    pub fn job_type(&self) -> JobType {
        match self.entity_type() {
            EntityType::Order => JobType::RefreshOrder,
            EntityType::Product => JobType::RefreshProduct,
        }
    }
}

impl core::fmt::Display for WebhookTopic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookTopic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        WebhookTopic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::permanent(format!("unsupported webhook topic: {s}")))
    }
}

/// Payload of `refresh_order` / `refresh_product` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshJob {
    pub remote_id: RemoteId,
    pub topic: WebhookTopic,
}

/// A verified, parsed webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub topic: WebhookTopic,
    pub remote_id: RemoteId,
    pub payload: JsonValue,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WebhookBody {
    topic: String,
    #[serde(deserialize_with = "event_id")]
    id: String,
    #[serde(default)]
    data: JsonValue,
}

fn event_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid resource id: {other}"))),
    }
}

/// Why a delivery was turned away.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("missing x-webhook-signature header")]
    MissingSignature,
    #[error("signature does not match")]
    BadSignature,
    #[error("webhook secret is not configured")]
    NotConfigured,
    #[error("malformed webhook body: {0}")]
    MalformedBody(String),
    #[error("unsupported webhook topic: {0}")]
    UnsupportedTopic(String),
}

impl Rejection {
    pub fn status_code(&self) -> u16 {
        match self {
            Rejection::MissingSignature | Rejection::BadSignature | Rejection::NotConfigured => {
                401
            }
            Rejection::MalformedBody(_) | Rejection::UnsupportedTopic(_) => 400,
        }
    }

    pub fn code(&self) -> &'static str {
        match self.status_code() {
            401 => "unauthorized",
            _ => "bad_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Accepted {
        job_id: JobId,
        topic: WebhookTopic,
        remote_id: RemoteId,
    },
    Rejected(Rejection),
}

/// Check `signature_header` against the HMAC-SHA256 of `raw_body`.
///
/// Accepts plain hex or `sha256=`-prefixed hex. The comparison is
/// constant-time. An empty secret never verifies.
pub fn verify(raw_body: &[u8], signature_header: Option<&str>, secret: &str) -> bool {
    let Some(header) = signature_header else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }
    let header = header.trim();
    let hex_digest = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Enqueue the refresh job for a provider event.
pub async fn enqueue_refresh(
    store: &dyn JobStore,
    topic: WebhookTopic,
    remote_id: RemoteId,
) -> SyncResult<JobId> {
    let payload = serde_json::to_vec(&RefreshJob { remote_id, topic })
        .map_err(|e| SyncError::permanent(format!("encode refresh job: {e}")))?;
    Ok(store.enqueue(topic.job_type(), payload, None).await?)
}

pub struct WebhookIngress {
    store: Arc<dyn JobStore>,
    credentials: Arc<dyn CredentialStore>,
    log: Arc<dyn LogSink>,
    clock: Arc<dyn Clock>,
}

impl WebhookIngress {
    pub fn new(
        store: Arc<dyn JobStore>,
        credentials: Arc<dyn CredentialStore>,
        log: Arc<dyn LogSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            credentials,
            log,
            clock,
        }
    }

    /// Run one delivery through the ingress state machine.
    ///
    /// `Err` means the event was valid but could not be enqueued; the
    /// provider should redeliver.
    pub async fn receive(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> SyncResult<WebhookOutcome> {
        let received_at = self.clock.now();

        let Some(secret) = self
            .credentials
            .get_secret(credentials::WEBHOOK_SECRET)
            .filter(|s| !s.is_empty())
        else {
            self.log.log(
                LogLevel::Error,
                "webhook rejected: no secret configured",
                &json!({ "received_at": received_at }),
            );
            return Ok(WebhookOutcome::Rejected(Rejection::NotConfigured));
        };

        let verified = match signature_header {
            None => Err(Rejection::MissingSignature),
            Some(header) if !verify(raw_body, Some(header), &secret) => {
                Err(Rejection::BadSignature)
            }
            Some(_) => Ok(()),
        };
        if let Err(rejection) = verified {
            return Ok(self.reject(rejection, received_at));
        }

        let event = match parse(raw_body, received_at) {
            Ok(event) => event,
            Err(rejection) => return Ok(self.reject(rejection, received_at)),
        };

        let job_id =
            enqueue_refresh(self.store.as_ref(), event.topic, event.remote_id.clone()).await?;

        self.log.log(
            LogLevel::Info,
            "webhook accepted",
            &json!({
                "topic": event.topic.as_str(),
                "remote_id": event.remote_id.as_str(),
                "job_id": job_id.to_string(),
                "received_at": event.received_at,
            }),
        );
        Ok(WebhookOutcome::Accepted {
            job_id,
            topic: event.topic,
            remote_id: event.remote_id,
        })
    }

    fn reject(&self, rejection: Rejection, received_at: DateTime<Utc>) -> WebhookOutcome {
        self.log.log(
            LogLevel::Warning,
            "webhook rejected",
            &json!({
                "reason": rejection.to_string(),
                "status": rejection.status_code(),
                "received_at": received_at,
            }),
        );
        WebhookOutcome::Rejected(rejection)
    }
}

fn parse(raw_body: &[u8], received_at: DateTime<Utc>) -> Result<WebhookEvent, Rejection> {
    let body: WebhookBody =
        serde_json::from_slice(raw_body).map_err(|e| Rejection::MalformedBody(e.to_string()))?;
    let topic = body
        .topic
        .parse::<WebhookTopic>()
        .map_err(|_| Rejection::UnsupportedTopic(body.topic.clone()))?;
    Ok(WebhookEvent {
        topic,
        remote_id: RemoteId::new(body.id),
        payload: body.data,
        received_at,
    })
}
