use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use fulfillsync_core::{ErrorKind, SyncError};

pub fn sync_error_to_response(err: SyncError) -> axum::response::Response {
    match err.kind() {
        ErrorKind::Permanent => json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "sync_rejected",
            err.message(),
        ),
        ErrorKind::Configuration => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_configured",
            err.message(),
        ),
        ErrorKind::Signature => json_error(StatusCode::UNAUTHORIZED, "unauthorized", err.message()),
        ErrorKind::Transient => {
            tracing::warn!(error = %err, "request failed on a transient error");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                err.message(),
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found(what: impl std::fmt::Display) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}
