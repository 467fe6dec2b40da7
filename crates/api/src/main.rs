use std::sync::Arc;

use anyhow::Context;

use fulfillsync_api::app::{self, services};
use fulfillsync_infra::SyncConfig;
use fulfillsync_infra::credentials::{self, InMemoryKeyValueStore};
use fulfillsync_sync::InMemoryEntityRepository;

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fulfillsync_observability::init();

    let config = SyncConfig::from_env().context("invalid sync configuration")?;
    let backend = services::Backend {
        database_url: env_opt("DATABASE_URL"),
        redis_url: env_opt("REDIS_URL"),
    };

    let keys = Arc::new(
        InMemoryKeyValueStore::new()
            .with_env(credentials::API_TOKEN, "FULFILLMENT_API_TOKEN")
            .with_env(credentials::SHOP_ID, "FULFILLMENT_SHOP_ID")
            .with_env(credentials::WEBHOOK_SECRET, "WEBHOOK_SECRET"),
    );
    // Standalone deployments have no host store; entities live in process memory.
    let repo = Arc::new(InMemoryEntityRepository::new());

    let services = Arc::new(
        services::build_services(&config, &backend, keys.clone(), keys, repo)
            .await
            .context("failed to wire sync services")?,
    );
    let dispatcher = services.dispatcher.clone().spawn();

    let app = app::build_app(services, env_opt("ADMIN_TOKEN"));

    let bind_addr = env_opt("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    dispatcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
