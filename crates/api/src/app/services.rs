//! Service wiring: stores, provider client, orchestrators, dispatcher.

use std::sync::Arc;

use fulfillsync_infra::client::{ApiClient, ApiError};
use fulfillsync_infra::clock::{Clock, SystemClock};
use fulfillsync_infra::correlation::{
    CorrelationStore, InMemoryCorrelationStore, PostgresCorrelationStore,
};
use fulfillsync_infra::credentials::{ConfigStore, CredentialStore};
use fulfillsync_infra::jobs::{Dispatcher, InMemoryJobStore, JobStore, PostgresJobStore};
use fulfillsync_infra::locks::{InMemoryLockManager, LockManager, PostgresLockManager};
use fulfillsync_infra::sync_log::{InMemorySyncLog, PostgresSyncLog, SyncLog};
use fulfillsync_infra::{SyncConfig, db};
use fulfillsync_observability::TracingSink;
use fulfillsync_sync::{
    EntityRepository, OrderSync, ProductSync, ProviderApi, SyncJobHandler, SyncService,
    WebhookIngress,
};

/// Entries kept by the in-memory API call log.
const MEMORY_SYNC_LOG_CAPACITY: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("provider client: {0}")]
    Client(#[from] ApiError),
    #[cfg(feature = "redis")]
    #[error("redis lock: {0}")]
    Redis(#[from] fulfillsync_infra::locks::LockError),
}

/// Where queue, lease, correlation and call-log state lives.
#[derive(Debug, Clone, Default)]
pub struct Backend {
    /// Postgres when set; process memory otherwise.
    pub database_url: Option<String>,
    /// Redis lease locks instead of the database/in-memory ones.
    pub redis_url: Option<String>,
}

/// Everything the HTTP layer and the dispatcher task share.
pub struct AppServices {
    pub sync: Arc<SyncService>,
    pub dispatcher: Arc<Dispatcher>,
    pub sync_log: Arc<dyn SyncLog>,
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    locks: Arc<dyn LockManager>,
    correlations: Arc<dyn CorrelationStore>,
    sync_log: Arc<dyn SyncLog>,
}

/// Wire the sync subsystem. `repo` is the host application's entity storage.
pub async fn build_services(
    config: &SyncConfig,
    backend: &Backend,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<dyn ConfigStore>,
    repo: Arc<dyn EntityRepository>,
) -> Result<AppServices, StartupError> {
    build_services_with_clock(config, backend, credentials, settings, repo, Arc::new(SystemClock))
        .await
}

pub async fn build_services_with_clock(
    config: &SyncConfig,
    backend: &Backend,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<dyn ConfigStore>,
    repo: Arc<dyn EntityRepository>,
    clock: Arc<dyn Clock>,
) -> Result<AppServices, StartupError> {
    let stores = build_stores(config, backend, clock.clone()).await?;

    let client = ApiClient::new(config, credentials.clone(), settings, clock.clone())?
        .with_sync_log(stores.sync_log.clone());
    let api = ProviderApi::new(Arc::new(client));

    let orders = OrderSync::new(
        repo.clone(),
        stores.correlations.clone(),
        api.clone(),
        clock.clone(),
    )
    .with_send_to_production(config.send_to_production);
    let products = ProductSync::new(repo.clone(), stores.correlations.clone(), api, clock.clone());
    let handler = Arc::new(SyncJobHandler::new(
        orders,
        products,
        stores.correlations.clone(),
        repo.clone(),
    ));

    let dispatcher = Dispatcher::new(
        stores.jobs.clone(),
        stores.locks.clone(),
        handler,
        clock.clone(),
        config.dispatcher_config(),
    )
    .with_sync_log(stores.sync_log.clone());

    let ingress = WebhookIngress::new(
        stores.jobs.clone(),
        credentials,
        Arc::new(TracingSink),
        clock,
    );
    let sync = SyncService::new(stores.jobs, repo, ingress);

    Ok(AppServices {
        sync: Arc::new(sync),
        dispatcher: Arc::new(dispatcher),
        sync_log: stores.sync_log,
    })
}

async fn build_stores(
    config: &SyncConfig,
    backend: &Backend,
    clock: Arc<dyn Clock>,
) -> Result<Stores, StartupError> {
    let stores = match backend.database_url.as_deref() {
        Some(url) => {
            let pool = db::connect(url).await?;
            db::migrate(&pool).await?;
            tracing::info!("using postgres stores");
            Stores {
                jobs: Arc::new(PostgresJobStore::new(
                    pool.clone(),
                    clock.clone(),
                    config.queue_max_attempts,
                )),
                locks: Arc::new(PostgresLockManager::new(
                    pool.clone(),
                    clock.clone(),
                    config.lock_ttl,
                )),
                correlations: Arc::new(PostgresCorrelationStore::new(pool.clone(), clock.clone())),
                sync_log: Arc::new(PostgresSyncLog::new(pool, clock.clone())),
            }
        }
        None => {
            tracing::warn!("DATABASE_URL not set; sync state is kept in memory");
            Stores {
                jobs: Arc::new(InMemoryJobStore::new(clock.clone(), config.queue_max_attempts)),
                locks: Arc::new(InMemoryLockManager::new(clock.clone(), config.lock_ttl)),
                correlations: Arc::new(InMemoryCorrelationStore::new(clock.clone())),
                sync_log: Arc::new(InMemorySyncLog::new(
                    clock.clone(),
                    MEMORY_SYNC_LOG_CAPACITY,
                )),
            }
        }
    };

    #[cfg(feature = "redis")]
    let stores = match backend.redis_url.as_deref() {
        Some(url) => {
            tracing::info!("using redis lease locks");
            Stores {
                locks: Arc::new(fulfillsync_infra::locks::RedisLockManager::new(
                    url,
                    "fulfillsync:lock:",
                    clock,
                    config.lock_ttl,
                )?),
                ..stores
            }
        }
        None => stores,
    };
    #[cfg(not(feature = "redis"))]
    if backend.redis_url.is_some() {
        tracing::warn!("REDIS_URL ignored: built without the redis feature");
    }

    Ok(stores)
}
