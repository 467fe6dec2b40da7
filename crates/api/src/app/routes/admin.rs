//! Operator endpoints: queue inspection and API call history.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
};
use serde::Deserialize;

use fulfillsync_infra::jobs::{JobId, JobStatus};

use crate::app::dto::LimitQuery;
use crate::app::errors;
use crate::app::services::AppServices;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/stats", get(job_stats))
        .route("/jobs/:id", delete(cancel_job))
        .route("/sync-log", get(sync_log))
}

/// GET /admin/jobs/stats
pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.sync.job_stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// GET /admin/jobs?status=&limit=
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<JobStatus>() {
            Ok(status) => Some(status),
            Err(e) => {
                return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.message());
            }
        },
    };
    let limit = LimitQuery { limit: query.limit }.limit_or(DEFAULT_LIMIT, MAX_LIMIT);

    match services.sync.list_jobs(status, limit).await {
        Ok(jobs) => {
            let items: Vec<_> = jobs
                .into_iter()
                .map(|job| {
                    serde_json::json!({
                        "id": job.id,
                        "job_type": job.job_type,
                        "status": job.status,
                        "attempts": job.attempts,
                        "max_attempts": job.max_attempts,
                        "payload": serde_json::from_slice::<serde_json::Value>(&job.payload).ok(),
                        "created_at": job.created_at,
                        "scheduled_for": job.scheduled_for,
                        "completed_at": job.completed_at,
                        "last_error": job.last_error,
                    })
                })
                .collect();
            (StatusCode::OK, Json(items)).into_response()
        }
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// DELETE /admin/jobs/:id - cancel a job that has not been claimed yet
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<JobId>,
) -> axum::response::Response {
    match services.sync.cancel_job(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => errors::json_error(
            StatusCode::CONFLICT,
            "not_pending",
            format!("job {id} is not pending or does not exist"),
        ),
        Err(e) => errors::sync_error_to_response(e),
    }
}

/// GET /admin/sync-log?limit= - most recent provider calls, newest first
pub async fn sync_log(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    match services
        .sync_log
        .recent(query.limit_or(DEFAULT_LIMIT, MAX_LIMIT))
        .await
    {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => errors::json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "unavailable",
            e.to_string(),
        ),
    }
}
