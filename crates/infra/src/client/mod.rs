//! Outbound provider API client.
//!
//! Every call attaches the bearer token, runs inside the inline retry budget
//! and honours the provider's quota headers. Provider-side failures are not
//! errors at this layer: they come back as an unsuccessful [`ApiResponse`]
//! so the caller can classify them. `Err` is reserved for faults no retry
//! can fix (missing credentials or a request that cannot be built).
//!
//! Inline waits are capped at `max_wait`. A backoff or quota reset further
//! out than that ends the call with `retry_at` set, so the job goes back to
//! the queue instead of holding its entity lease while it sleeps.

pub mod rate_limit;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::ACCEPT;
use serde::Serialize;
use serde_json::Value as JsonValue;

use fulfillsync_core::SyncError;

use crate::clock::{self, Clock};
use crate::config::SyncConfig;
use crate::credentials::{self, ConfigStore, CredentialStore};
use crate::retry::{Failure, RetryMachine, RetryPolicy, RetryState};
use crate::sync_log::{SyncLog, SyncLogEntry};

pub use rate_limit::RateLimitInfo;

/// Result of one logical request (all of its attempts).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    /// HTTP status of the last attempt; `None` if no response arrived.
    pub status: Option<u16>,
    pub data: Option<JsonValue>,
    pub error: Option<String>,
    pub attempts: u32,
    /// Set when the call gave up early because the next attempt is further
    /// out than the client may wait inline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl ApiResponse {
    pub fn ok(status: u16, data: Option<JsonValue>) -> Self {
        Self {
            success: true,
            status: Some(status),
            data,
            error: None,
            attempts: 1,
            retry_at: None,
        }
    }

    pub fn failed(status: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            data: None,
            error: Some(error.into()),
            attempts: 1,
            retry_at: None,
        }
    }

    pub fn deferred(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("API client is not configured: {0}")]
    Configuration(String),
    #[error("request could not be sent: {0}")]
    Transport(String),
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Configuration(msg) => SyncError::configuration(msg),
            ApiError::Transport(_) => SyncError::transient(err.to_string()),
        }
    }
}

/// Seam between the sync orchestration and HTTP.
#[async_trait::async_trait]
pub trait ApiTransport: Send + Sync {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<ApiResponse, ApiError>;

    /// Provider shop this integration is connected to.
    fn shop_id(&self) -> Result<String, ApiError>;

    /// `shops/{shop_id}/{resource}`.
    fn shop_path(&self, resource: &str) -> Result<String, ApiError> {
        Ok(format!(
            "shops/{}/{}",
            self.shop_id()?,
            resource.trim_start_matches('/')
        ))
    }
}

/// reqwest-backed [`ApiTransport`].
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<dyn ConfigStore>,
    policy: RetryPolicy,
    /// Longest single sleep allowed inside `request`.
    max_wait: Duration,
    clock: Arc<dyn Clock>,
    sync_log: Option<Arc<dyn SyncLog>>,
    /// Set when the provider reports an exhausted quota.
    blocked_until: Mutex<Option<DateTime<Utc>>>,
}

impl ApiClient {
    pub fn new(
        config: &SyncConfig,
        credentials: Arc<dyn CredentialStore>,
        settings: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Configuration(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            credentials,
            settings,
            policy: config.client_policy(),
            max_wait: config.max_inline_wait(),
            clock,
            sync_log: None,
            blocked_until: Mutex::new(None),
        })
    }

    pub fn with_sync_log(mut self, sync_log: Arc<dyn SyncLog>) -> Self {
        self.sync_log = Some(sync_log);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sleep until a previously reported quota reset, if any.
    ///
    /// Returns the reset time instead of sleeping when it is further out than
    /// `max_wait`; the block stays in place for other callers.
    async fn wait_for_quota(&self) -> Option<DateTime<Utc>> {
        let wait = {
            let mut blocked = self
                .blocked_until
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let until = (*blocked)?;
            let wait = clock::until(self.clock.now(), until);
            if wait > self.max_wait {
                return Some(until);
            }
            *blocked = None;
            wait
        };
        if !wait.is_zero() {
            tracing::info!(wait_ms = wait.as_millis() as u64, "waiting for rate limit reset");
            self.clock.sleep(wait).await;
        }
        None
    }

    fn note_quota(&self, status: u16, info: &RateLimitInfo) {
        if status == 429 || info.exhausted() {
            if let Some(reset_at) = info.reset_at {
                *self
                    .blocked_until
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(reset_at);
            }
        }
    }

    async fn log_call(
        &self,
        endpoint: &str,
        method: &Method,
        status: Option<u16>,
        started: Instant,
        rate_limit_remaining: Option<u32>,
    ) {
        let Some(sync_log) = &self.sync_log else {
            return;
        };
        let entry = SyncLogEntry {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            status,
            response_time_ms: started.elapsed().as_millis() as u64,
            rate_limit_remaining,
            created_at: self.clock.now(),
        };
        if let Err(e) = sync_log.append(entry).await {
            tracing::warn!(error = %e, endpoint, "failed to record API call");
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("policy", &self.policy)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

/// What a single attempt produced.
enum Attempt {
    Done(ApiResponse),
    Failed {
        failure: Failure,
        status: Option<u16>,
        data: Option<JsonValue>,
        error: String,
    },
}

/// What to do after an attempt.
enum Next {
    Return,
    Retry(Duration),
    Defer(DateTime<Utc>),
}

#[async_trait::async_trait]
impl ApiTransport for ApiClient {
    #[tracing::instrument(skip(self, method, body), fields(method = %method), err)]
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<ApiResponse, ApiError> {
        let token = self
            .credentials
            .get_secret(credentials::API_TOKEN)
            .ok_or_else(|| ApiError::Configuration("API token is not set".to_string()))?;
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));

        let mut machine = RetryMachine::new(&self.policy);
        loop {
            let Some(attempt) = machine.begin_attempt() else {
                return Err(ApiError::Transport(format!(
                    "retry state machine stuck in {:?}",
                    machine.state()
                )));
            };
            if let Some(until) = self.wait_for_quota().await {
                tracing::info!(%until, "quota reset too far out, deferring call");
                let mut response =
                    ApiResponse::failed(Some(429), format!("HTTP 429: quota exhausted until {until}"))
                        .deferred(until);
                response.attempts = attempt - 1;
                return Ok(response);
            }

            let started = Instant::now();
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&token)
                .header(ACCEPT, "application/json");
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let (outcome, remaining) = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let info = RateLimitInfo::from_headers(response.headers(), self.clock.now());
                    self.note_quota(status.as_u16(), &info);

                    let outcome = match response.text().await {
                        Ok(text) => classify(status, &info, &text, attempt),
                        Err(e) => Attempt::Failed {
                            failure: Failure::Network(e.to_string()),
                            status: Some(status.as_u16()),
                            data: None,
                            error: format!("failed to read response body: {e}"),
                        },
                    };
                    (outcome, info.remaining)
                }
                Err(e) if e.is_builder() => {
                    return Err(ApiError::Transport(e.to_string()));
                }
                Err(e) => {
                    let failure = if e.is_timeout() {
                        Failure::Timeout
                    } else {
                        Failure::Network(e.to_string())
                    };
                    let outcome = Attempt::Failed {
                        error: failure.to_string(),
                        failure,
                        status: None,
                        data: None,
                    };
                    (outcome, None)
                }
            };

            let next = match &outcome {
                Attempt::Done(_) => {
                    machine.succeed();
                    Next::Return
                }
                Attempt::Failed { failure, .. } => {
                    let now = self.clock.now();
                    match machine.fail(failure, now).clone() {
                        RetryState::Retrying { delay, .. } if delay <= self.max_wait => {
                            Next::Retry(delay)
                        }
                        RetryState::Retrying { delay, .. } => Next::Defer(clock::after(now, delay)),
                        _ => Next::Return,
                    }
                }
            };

            // Only the attempt that ends the call is recorded.
            let status = match &outcome {
                Attempt::Done(response) => response.status,
                Attempt::Failed { status, .. } => *status,
            };
            if !matches!(next, Next::Retry(_)) {
                self.log_call(endpoint, &method, status, started, remaining)
                    .await;
            }

            match (outcome, next) {
                (_, Next::Retry(delay)) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "provider call failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                (Attempt::Done(mut response), _) => {
                    response.attempts = attempt;
                    return Ok(response);
                }
                (
                    Attempt::Failed {
                        failure,
                        status,
                        data,
                        error,
                    },
                    next,
                ) => {
                    let retry_at = match next {
                        Next::Defer(at) => {
                            tracing::warn!(attempt, %failure, %at, "provider call failed, deferring retry");
                            Some(at)
                        }
                        _ => {
                            tracing::warn!(attempt, %failure, "provider call failed");
                            None
                        }
                    };
                    return Ok(ApiResponse {
                        success: false,
                        status,
                        data,
                        error: Some(error),
                        attempts: attempt,
                        retry_at,
                    });
                }
            }
        }
    }

    fn shop_id(&self) -> Result<String, ApiError> {
        self.settings
            .get(credentials::SHOP_ID)
            .ok_or_else(|| ApiError::Configuration("shop id is not set".to_string()))
    }
}

/// Turn a received response into an attempt outcome.
///
/// A success status always counts as success: the remote side has already
/// acted, so a body that is not JSON is logged and dropped rather than
/// turned into a failure.
fn classify(status: reqwest::StatusCode, info: &RateLimitInfo, text: &str, attempt: u32) -> Attempt {
    let code = status.as_u16();

    if status.is_success() {
        let data = if text.trim().is_empty() {
            None
        } else {
            match serde_json::from_str(text) {
                Ok(data) => Some(data),
                Err(e) => {
                    let snippet: String = text.chars().take(200).collect();
                    tracing::warn!(code, error = %e, body = %snippet, "success response is not JSON");
                    None
                }
            }
        };
        return Attempt::Done(ApiResponse::ok(code, data));
    }

    let data: Option<JsonValue> = serde_json::from_str(text).ok();
    let rate_limit_reset = if code == 429 || info.exhausted() {
        info.reset_at
    } else {
        None
    };
    tracing::debug!(attempt, code, "provider returned an error status");

    Attempt::Failed {
        error: error_message(code, data.as_ref(), text),
        failure: Failure::Status {
            code,
            rate_limit_reset,
        },
        status: Some(code),
        data,
    }
}

/// Best human-readable message in a provider error body.
fn error_message(code: u16, data: Option<&JsonValue>, text: &str) -> String {
    let from_body = data.and_then(|body| {
        ["message", "error", "errors"]
            .iter()
            .find_map(|key| match body.get(*key)? {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Null => None,
                other => Some(other.to_string()),
            })
    });

    match from_body {
        Some(message) => format!("HTTP {code}: {message}"),
        None if text.trim().is_empty() => format!("HTTP {code}"),
        None => {
            let snippet: String = text.chars().take(200).collect();
            format!("HTTP {code}: {snippet}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::InMemoryKeyValueStore;
    use crate::sync_log::InMemorySyncLog;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn client(base_url: String, clock: Arc<ManualClock>) -> (ApiClient, Arc<InMemorySyncLog>) {
        let config = SyncConfig {
            api_base_url: base_url,
            ..SyncConfig::default()
        };
        let store = Arc::new(
            InMemoryKeyValueStore::new()
                .with(credentials::API_TOKEN, "test-token")
                .with(credentials::SHOP_ID, "77"),
        );
        let log = Arc::new(InMemorySyncLog::new(clock.clone(), 100));
        let client = ApiClient::new(&config, store.clone(), store, clock)
            .unwrap()
            .with_sync_log(log.clone());
        (client, log)
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/v1/shops/77/orders.json",
            post(move |headers: HeaderMap| {
                let counter = counter.clone();
                async move {
                    assert_eq!(
                        headers.get("authorization").unwrap(),
                        "Bearer test-token"
                    );
                    match counter.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
                        _ => (
                            StatusCode::CREATED,
                            axum::Json(json!({"id": "remote-999"})),
                        )
                            .into_response(),
                    }
                }
            }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, log) = client(spawn_server(router).await, clock.clone());

        let path = client.shop_path("orders.json").unwrap();
        let response = client
            .request(Method::POST, &path, Some(&json!({"external_id": "42"})))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.status, Some(201));
        assert_eq!(response.attempts, 3);
        assert_eq!(response.data.unwrap()["id"], "remote-999");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );

        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, Some(201));
        assert_eq!(entries[0].method, "POST");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let router = Router::new().route(
            "/v1/shops/77/orders/1.json",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    axum::Json(json!({"message": "Order not found"})),
                )
            }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, _) = client(spawn_server(router).await, clock.clone());

        let response = client
            .request(Method::GET, "shops/77/orders/1.json", None)
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.status, Some(404));
        assert_eq!(response.attempts, 1);
        assert_eq!(response.error.as_deref(), Some("HTTP 404: Order not found"));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn rate_limited_calls_wait_for_the_reset() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/v1/shops.json",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        let mut headers = HeaderMap::new();
                        headers.insert("retry-after", "7".parse().unwrap());
                        (StatusCode::TOO_MANY_REQUESTS, headers, "slow down").into_response()
                    } else {
                        axum::Json(json!([])).into_response()
                    }
                }
            }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, _) = client(spawn_server(router).await, clock.clone());

        let response = client.request(Method::GET, "shops.json", None).await.unwrap();
        assert!(response.success);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(7)]);
    }

    #[tokio::test]
    async fn distant_quota_resets_are_deferred_not_slept() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/v1/shops.json",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let mut headers = HeaderMap::new();
                    headers.insert("retry-after", "900".parse().unwrap());
                    (StatusCode::TOO_MANY_REQUESTS, headers, "slow down").into_response()
                }
            }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, log) = client(spawn_server(router).await, clock.clone());
        let reset = clock.now() + chrono::Duration::seconds(900);

        let response = client.request(Method::GET, "shops.json", None).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.status, Some(429));
        assert_eq!(response.attempts, 1);
        assert_eq!(response.retry_at, Some(reset));
        assert!(clock.sleeps().is_empty());
        assert_eq!(log.recent(10).await.unwrap()[0].status, Some(429));

        // Still blocked: the next call is deferred without reaching the provider.
        let response = client.request(Method::GET, "shops.json", None).await.unwrap();
        assert_eq!(response.retry_at, Some(reset));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn backoff_beyond_the_wait_cap_is_deferred() {
        let router = Router::new().route(
            "/v1/shops.json",
            get(|| async { (StatusCode::BAD_GATEWAY, "bad gateway") }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, _) = client(spawn_server(router).await, clock.clone());
        let client = client.with_max_wait(Duration::from_millis(1_500));
        let started = clock.now();

        let response = client.request(Method::GET, "shops.json", None).await.unwrap();
        // 1s fits under the cap, the following 2s does not.
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
        assert_eq!(response.attempts, 2);
        assert_eq!(
            response.retry_at,
            Some(started + chrono::Duration::seconds(3))
        );
    }

    #[tokio::test]
    async fn non_json_success_bodies_still_count_as_success() {
        let router = Router::new().route(
            "/v1/shops/77/orders.json",
            post(|| async {
                (
                    StatusCode::CREATED,
                    [("content-type", "text/plain")],
                    "created",
                )
            }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, log) = client(spawn_server(router).await, clock);

        let response = client
            .request(Method::POST, "shops/77/orders.json", Some(&json!({})))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.status, Some(201));
        assert_eq!(response.data, None);

        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, Some(201));
    }

    #[tokio::test]
    async fn exhausted_quota_delays_the_next_call() {
        let router = Router::new().route(
            "/v1/shops.json",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
                headers.insert("x-ratelimit-reset", "30".parse().unwrap());
                (headers, axum::Json(json!([])))
            }),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, log) = client(spawn_server(router).await, clock.clone());

        client.request(Method::GET, "shops.json", None).await.unwrap();
        assert!(clock.sleeps().is_empty());

        client.request(Method::GET, "shops.json", None).await.unwrap();
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
        assert_eq!(log.recent(1).await.unwrap()[0].rate_limit_remaining, Some(0));
    }

    #[tokio::test]
    async fn a_poisoned_quota_lock_does_not_take_the_client_down() {
        let router = Router::new().route("/v1/shops.json", get(|| async { axum::Json(json!([])) }));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (client, _) = client(spawn_server(router).await, clock);

        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = client.blocked_until.lock().unwrap();
            panic!("poison the quota lock");
        }));
        assert!(poisoned.is_err());
        assert!(client.blocked_until.is_poisoned());

        let response = client.request(Method::GET, "shops.json", None).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_call() {
        let config = SyncConfig {
            // Nothing listens here; the call must not get that far.
            api_base_url: "http://127.0.0.1:9/v1".to_string(),
            ..SyncConfig::default()
        };
        let store = Arc::new(InMemoryKeyValueStore::new());
        let clock = Arc::new(ManualClock::default());
        let client = ApiClient::new(&config, store.clone(), store, clock).unwrap();

        let err = client
            .request(Method::GET, "shops.json", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Configuration(_)));
        assert!(matches!(
            client.shop_path("orders.json"),
            Err(ApiError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn connection_failures_exhaust_the_inline_budget() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let clock = Arc::new(ManualClock::default());
        let (client, log) = client(format!("http://{addr}/v1"), clock.clone());
        let response = client.request(Method::GET, "shops.json", None).await.unwrap();

        assert!(!response.success);
        assert_eq!(response.status, None);
        assert_eq!(response.attempts, 3);
        assert_eq!(log.recent(10).await.unwrap()[0].status, None);
    }
}
