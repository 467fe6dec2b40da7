//! Provider webhook intake.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};

use fulfillsync_sync::{SIGNATURE_HEADER, WebhookOutcome};

use crate::app::dto::WebhookAcceptedResponse;
use crate::app::errors;
use crate::app::services::AppServices;

/// POST /webhooks
///
/// The body is verified byte-for-byte, so it is taken raw rather than as JSON.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match services.sync.receive_webhook(&body, signature).await {
        Ok(WebhookOutcome::Accepted { job_id, .. }) => (
            StatusCode::OK,
            Json(WebhookAcceptedResponse {
                success: true,
                job_id,
            }),
        )
            .into_response(),
        Ok(WebhookOutcome::Rejected(rejection)) => {
            let status = StatusCode::from_u16(rejection.status_code())
                .unwrap_or(StatusCode::BAD_REQUEST);
            errors::json_error(status, rejection.code(), rejection.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "accepted webhook could not be queued");
            errors::json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "webhook could not be queued; retry later",
            )
        }
    }
}
