use axum::Router;

pub mod admin;
pub mod sync;
pub mod system;
pub mod webhooks;

/// Router for the bearer-protected operator endpoints.
pub fn protected_router() -> Router {
    Router::new()
        .nest("/sync", sync::router())
        .nest("/admin", admin::router())
}
