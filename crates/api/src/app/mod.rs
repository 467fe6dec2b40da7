//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, provider client, orchestrators, dispatcher
//! - `routes/`: HTTP handlers, one file per area
//! - `dto.rs`: path parsing and response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>, admin_token: Option<String>) -> Router {
    let auth = middleware::AdminAuth::new(admin_token);

    let protected = routes::protected_router().layer(axum::middleware::from_fn_with_state(
        auth,
        middleware::admin_auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/webhooks", post(routes::webhooks::receive))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
