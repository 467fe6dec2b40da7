//! Manual sync triggers and status lookups.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use crate::app::dto::{EntityPath, SyncQueuedResponse};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/:entity/:id", post(enqueue_sync).get(get_sync_status))
}

/// POST /sync/:entity/:id - queue an outbound sync
pub async fn enqueue_sync(
    Extension(services): Extension<Arc<AppServices>>,
    Path(path): Path<EntityPath>,
) -> axum::response::Response {
    let (entity_type, entity_id) = match path.parse() {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    match services.sync.entity_exists(entity_type, entity_id).await {
        Ok(true) => {}
        Ok(false) => return errors::not_found(format!("{entity_type} {entity_id}")),
        Err(e) => return errors::sync_error_to_response(e),
    }

    match services.sync.enqueue_sync(entity_type, entity_id).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(SyncQueuedResponse {
                job_id,
                entity_type,
                entity_id,
            }),
        )
            .into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// GET /sync/:entity/:id - current sync state of an entity
pub async fn get_sync_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(path): Path<EntityPath>,
) -> axum::response::Response {
    let (entity_type, entity_id) = match path.parse() {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    match services.sync.entity_exists(entity_type, entity_id).await {
        Ok(true) => {}
        Ok(false) => return errors::not_found(format!("{entity_type} {entity_id}")),
        Err(e) => return errors::sync_error_to_response(e),
    }

    match services.sync.get_sync_status(entity_type, entity_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}
