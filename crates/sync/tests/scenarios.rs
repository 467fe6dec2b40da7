//! End-to-end sync flows: queue → dispatcher → orchestrator → HTTP client
//! against a mock provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use fulfillsync_core::{EntityType, LocalId, LocalOrderStatus, RemoteId, SyncStatus};
use fulfillsync_infra::client::ApiClient;
use fulfillsync_infra::clock::ManualClock;
use fulfillsync_infra::correlation::{CorrelationStore, InMemoryCorrelationStore};
use fulfillsync_infra::credentials::{self, InMemoryKeyValueStore};
use fulfillsync_infra::jobs::{
    Dispatcher, DispatcherConfig, InMemoryJobStore, JobStatus, JobStore,
};
use fulfillsync_infra::locks::InMemoryLockManager;
use fulfillsync_infra::{Clock, RetryPolicy, SyncConfig};
use fulfillsync_observability::MemorySink;
use fulfillsync_sync::{
    EntityRepository, InMemoryEntityRepository, LocalOrder, OrderLine, OrderSync, ProductSync,
    ProviderApi, ShippingAddress, SyncJobHandler, SyncService, WebhookIngress, WebhookOutcome,
};

const WEBHOOK_SECRET: &str = "whsec-scenarios";

async fn spawn_provider(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/v1")
}

struct World {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryJobStore>,
    locks: Arc<InMemoryLockManager>,
    correlations: Arc<InMemoryCorrelationStore>,
    repo: Arc<InMemoryEntityRepository>,
    handler: Arc<SyncJobHandler>,
    service: SyncService,
}

impl World {
    async fn new(base_url: String) -> Self {
        Self::with_client_policy(base_url, RetryPolicy::no_retry()).await
    }

    async fn with_client_policy(base_url: String, client_policy: RetryPolicy) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryJobStore::new(clock.clone(), 3));
        let locks = Arc::new(InMemoryLockManager::new(clock.clone(), Duration::from_secs(300)));
        let correlations = Arc::new(InMemoryCorrelationStore::new(clock.clone()));
        let repo = Arc::new(InMemoryEntityRepository::new());
        let keys = Arc::new(
            InMemoryKeyValueStore::new()
                .with(credentials::API_TOKEN, "test-token")
                .with(credentials::SHOP_ID, "77")
                .with(credentials::WEBHOOK_SECRET, WEBHOOK_SECRET),
        );

        let config = SyncConfig {
            api_base_url: base_url,
            ..SyncConfig::default()
        };
        let client = ApiClient::new(&config, keys.clone(), keys.clone(), clock.clone())
            .unwrap()
            .with_policy(client_policy);
        let api = ProviderApi::new(Arc::new(client));

        let handler = Arc::new(SyncJobHandler::new(
            OrderSync::new(repo.clone(), correlations.clone(), api.clone(), clock.clone()),
            ProductSync::new(repo.clone(), correlations.clone(), api, clock.clone()),
            correlations.clone(),
            repo.clone(),
        ));
        let ingress = WebhookIngress::new(
            store.clone(),
            keys,
            Arc::new(MemorySink::new()),
            clock.clone(),
        );
        let service = SyncService::new(store.clone(), repo.clone(), ingress);

        // Product 7 is already on the provider, so order lines can reference it.
        correlations
            .insert(EntityType::Product, LocalId::new(7), RemoteId::from("prod-1"))
            .await
            .unwrap();
        repo.insert_order(order(42));

        Self {
            clock,
            store,
            locks,
            correlations,
            repo,
            handler,
            service,
        }
    }

    fn dispatcher(&self, batch_size: usize) -> Dispatcher {
        let config = DispatcherConfig {
            batch_size,
            queue_policy: RetryPolicy::exponential(
                3,
                Duration::from_secs(60),
                Duration::from_secs(3600),
            ),
            ..DispatcherConfig::default()
        };
        Dispatcher::new(
            self.store.clone(),
            self.locks.clone(),
            self.handler.clone(),
            self.clock.clone(),
            config,
        )
    }

    async fn order_meta(&self, id: i64) -> fulfillsync_sync::SyncMeta {
        self.repo
            .get_meta(EntityType::Order, LocalId::new(id))
            .await
            .unwrap()
    }
}

fn order(id: i64) -> LocalOrder {
    LocalOrder {
        id: LocalId::new(id),
        status: LocalOrderStatus::Processing,
        shipping_method: "flat_rate".to_string(),
        shipping: ShippingAddress {
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            email: "ada@example.com".to_string(),
            country: "gb".to_string(),
            address1: "12 St James's Square".to_string(),
            city: "London".to_string(),
            zip: "SW1Y 4JH".to_string(),
            ..ShippingAddress::default()
        },
        line_items: vec![OrderLine {
            product_id: Some(LocalId::new(7)),
            remote_variant_id: Some(101),
            quantity: 2,
        }],
    }
}

fn sign(body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[tokio::test]
async fn order_create_survives_two_server_errors() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let router = Router::new().route(
        "/v1/shops/77/orders.json",
        post(move |axum::Json(body): axum::Json<serde_json::Value>| {
            let counter = counter.clone();
            async move {
                assert_eq!(body["external_id"], "42");
                assert_eq!(body["line_items"][0]["product_id"], "prod-1");
                assert_eq!(body["address_to"]["country"], "GB");
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => (StatusCode::INTERNAL_SERVER_ERROR, "upstream down").into_response(),
                    _ => (StatusCode::CREATED, axum::Json(json!({"id": "remote-999"})))
                        .into_response(),
                }
            }
        }),
    );
    let world = World::new(spawn_provider(router).await).await;
    let dispatcher = world.dispatcher(50);

    let job_id = world
        .service
        .enqueue_sync(EntityType::Order, LocalId::new(42))
        .await
        .unwrap();

    // Attempt 1: HTTP 500.
    assert_eq!(dispatcher.run_cycle().await.unwrap().failed, 1);
    let job = world.store.get(job_id).await.unwrap().unwrap();
    assert_eq!((job.status, job.attempts), (JobStatus::Failed, 1));
    let meta = world.order_meta(42).await;
    assert_eq!(meta.sync_status, SyncStatus::Pending);
    assert!(meta.last_error.unwrap().contains("500"));

    // Not due until the queue backoff elapses.
    assert_eq!(dispatcher.sweep().await.unwrap().reset_failed, 0);
    world.clock.advance(Duration::from_secs(60));
    dispatcher.sweep().await.unwrap();

    // Attempt 2: HTTP 500.
    assert_eq!(dispatcher.run_cycle().await.unwrap().failed, 1);
    world.clock.advance(Duration::from_secs(120));
    dispatcher.sweep().await.unwrap();

    // Attempt 3: created.
    assert_eq!(dispatcher.run_cycle().await.unwrap().completed, 1);
    let job = world.store.get(job_id).await.unwrap().unwrap();
    assert_eq!((job.status, job.attempts), (JobStatus::Completed, 2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let link = world
        .correlations
        .find_by_local(EntityType::Order, LocalId::new(42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.remote_id, RemoteId::from("remote-999"));

    let status = world
        .service
        .get_sync_status(EntityType::Order, LocalId::new(42))
        .await
        .unwrap();
    assert_eq!(status.status, SyncStatus::Synced);
    assert_eq!(status.remote_id, Some(RemoteId::from("remote-999")));
    assert_eq!(status.last_error, None);
    assert_eq!(
        world.repo.notes(EntityType::Order, LocalId::new(42)),
        vec!["Fulfillment order remote-999 created.".to_string()]
    );
}

#[tokio::test]
async fn signed_order_webhook_refreshes_the_local_order() {
    let router = Router::new().route(
        "/v1/shops/77/orders/remote-999.json",
        get(|| async {
            axum::Json(json!({
                "id": "remote-999",
                "status": "fulfilled",
                "external_id": "42",
                "shipments": [
                    {"carrier": "usps", "number": "9400 1000", "url": "https://track.example/9400"}
                ]
            }))
        }),
    );
    let world = World::new(spawn_provider(router).await).await;
    world
        .correlations
        .insert(EntityType::Order, LocalId::new(42), RemoteId::from("remote-999"))
        .await
        .unwrap();
    let dispatcher = world.dispatcher(50);

    let body = serde_json::to_vec(&json!({
        "topic": "order:updated",
        "id": "remote-999",
        "data": {"status": "fulfilled"}
    }))
    .unwrap();
    let outcome = world
        .service
        .receive_webhook(&body, Some(&sign(&body)))
        .await
        .unwrap();
    let WebhookOutcome::Accepted { job_id, .. } = outcome else {
        panic!("webhook rejected: {outcome:?}");
    };

    assert_eq!(dispatcher.run_cycle().await.unwrap().completed, 1);
    assert_eq!(
        world.store.get(job_id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );

    let order = world
        .repo
        .load_order(LocalId::new(42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, LocalOrderStatus::Completed);
    let meta = world.order_meta(42).await;
    assert_eq!(meta.sync_status, SyncStatus::Synced);
    assert_eq!(meta.tracking.unwrap().number, "9400 1000");
    assert_eq!(world.repo.notes(EntityType::Order, LocalId::new(42)).len(), 1);

    // A redelivery of the same event changes nothing.
    world.service.receive_webhook(&body, Some(&sign(&body))).await.unwrap();
    assert_eq!(dispatcher.run_cycle().await.unwrap().completed, 1);
    assert_eq!(world.repo.notes(EntityType::Order, LocalId::new(42)).len(), 1);
}

#[tokio::test]
async fn forged_webhooks_never_reach_the_queue() {
    let world = World::new(spawn_provider(Router::new()).await).await;
    let body = br#"{"topic":"order:updated","id":"remote-999"}"#;

    let outcome = world
        .service
        .receive_webhook(body, Some(&sign(b"something else")))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Rejected(_)));
    assert_eq!(world.service.job_stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn persistent_server_errors_end_in_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let router = Router::new().route(
        "/v1/shops/77/orders.json",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(json!({"message": "boom"})))
            }
        }),
    );
    let world = World::new(spawn_provider(router).await).await;
    let dispatcher = world.dispatcher(50);

    let job_id = world
        .service
        .enqueue_sync(EntityType::Order, LocalId::new(42))
        .await
        .unwrap();

    for _ in 0..3 {
        dispatcher.run_cycle().await.unwrap();
        world.clock.advance(Duration::from_secs(3600));
        dispatcher.sweep().await.unwrap();
    }

    let job = world.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.attempts, 3);

    let meta = world.order_meta(42).await;
    assert_eq!(meta.sync_status, SyncStatus::Failed);
    assert!(meta.last_error.as_deref().unwrap().contains("HTTP 500: boom"));
    let notes = world.repo.notes(EntityType::Order, LocalId::new(42));
    assert_eq!(notes.len(), 1);
    assert!(notes[0].starts_with("Fulfillment sync failed:"));

    // Terminal jobs stay terminal.
    world.clock.advance(Duration::from_secs(24 * 3600));
    assert_eq!(dispatcher.sweep().await.unwrap().reset_failed, 0);
    assert_eq!(dispatcher.run_cycle().await.unwrap().claimed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn orders_without_linked_products_fail_without_calling_the_provider() {
    let world = World::new(spawn_provider(Router::new()).await).await;
    let mut unlinked = order(43);
    unlinked.line_items[0].product_id = Some(LocalId::new(8));
    world.repo.insert_order(unlinked);
    let dispatcher = world.dispatcher(50);

    let job_id = world
        .service
        .enqueue_sync(EntityType::Order, LocalId::new(43))
        .await
        .unwrap();
    assert_eq!(dispatcher.run_cycle().await.unwrap().errored, 1);

    let job = world.store.get(job_id).await.unwrap().unwrap();
    assert_eq!((job.status, job.attempts), (JobStatus::Error, 0));
    assert_eq!(world.order_meta(43).await.sync_status, SyncStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dispatchers_never_sync_one_order_twice_at_once() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let track = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        move || {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        }
    };
    let on_create = track.clone();
    let on_update = track;
    let router = Router::new()
        .route(
            "/v1/shops/77/orders.json",
            post(move || {
                let wait = on_create();
                async move {
                    wait.await;
                    (StatusCode::CREATED, axum::Json(json!({"id": "remote-999"})))
                }
            }),
        )
        .route(
            "/v1/shops/77/orders/remote-999.json",
            put(move || {
                let wait = on_update();
                async move {
                    wait.await;
                    axum::Json(json!({"id": "remote-999"}))
                }
            }),
        );
    let world = World::new(spawn_provider(router).await).await;

    let mut jobs = Vec::new();
    for _ in 0..4 {
        jobs.push(
            world
                .service
                .enqueue_sync(EntityType::Order, LocalId::new(42))
                .await
                .unwrap(),
        );
    }

    let dispatchers: Vec<Arc<Dispatcher>> =
        (0..4).map(|_| Arc::new(world.dispatcher(1))).collect();
    for _ in 0..50 {
        if world.store.stats().await.unwrap().completed == jobs.len() {
            break;
        }
        let handles: Vec<_> = dispatchers
            .iter()
            .cloned()
            .map(|d| tokio::spawn(async move { d.run_cycle().await.unwrap() }))
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(world.store.stats().await.unwrap().error, 0);
    }

    for id in jobs {
        assert_eq!(
            world.store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(
        world
            .correlations
            .find_by_local(EntityType::Order, LocalId::new(42))
            .await
            .unwrap()
            .unwrap()
            .remote_id,
        RemoteId::from("remote-999")
    );
}

#[tokio::test]
async fn long_rate_limits_go_back_to_the_queue_instead_of_outliving_the_lease() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let router = Router::new().route(
        "/v1/shops/77/orders.json",
        post(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut headers = HeaderMap::new();
                    headers.insert("retry-after", "900".parse().unwrap());
                    (StatusCode::TOO_MANY_REQUESTS, headers, "slow down").into_response()
                } else {
                    (StatusCode::CREATED, axum::Json(json!({"id": "remote-999"}))).into_response()
                }
            }
        }),
    );
    let world = World::with_client_policy(
        spawn_provider(router).await,
        SyncConfig::default().client_policy(),
    )
    .await;
    let first = world.dispatcher(50);
    let second = world.dispatcher(50);
    let started = world.clock.now();

    let job_id = world
        .service
        .enqueue_sync(EntityType::Order, LocalId::new(42))
        .await
        .unwrap();

    let report = first.run_cycle().await.unwrap();
    assert_eq!((report.claimed, report.failed), (1, 1));
    let max_wait = SyncConfig::default().max_inline_wait();
    assert!(world.clock.sleeps().iter().all(|slept| *slept <= max_wait));

    let job = world.store.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.scheduled_for, started + chrono::Duration::seconds(900));

    // Another dispatcher ticking before the reset finds nothing to take over.
    world.clock.advance(Duration::from_secs(400));
    let sweep = second.sweep().await.unwrap();
    assert_eq!((sweep.requeued_stale, sweep.reclaimed_locks, sweep.reset_failed), (0, 0, 0));
    assert_eq!(second.run_cycle().await.unwrap().claimed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    world.clock.advance(Duration::from_secs(500));
    assert_eq!(second.sweep().await.unwrap().reset_failed, 1);
    assert_eq!(second.run_cycle().await.unwrap().completed, 1);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let link = world
        .correlations
        .find_by_local(EntityType::Order, LocalId::new(42))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.remote_id, RemoteId::from("remote-999"));
}
