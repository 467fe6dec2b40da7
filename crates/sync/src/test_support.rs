//! Fakes shared by the unit tests of this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use reqwest::Method;
use serde_json::Value as JsonValue;

use fulfillsync_infra::client::{ApiError, ApiResponse, ApiTransport};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<JsonValue>,
}

/// Transport with canned responses per route. The last response queued for
/// a route repeats; unknown routes answer 404.
#[derive(Debug)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<ApiResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
    shop_id: Option<String>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            shop_id: Some("77".to_string()),
        }
    }

    pub fn without_shop(mut self) -> Self {
        self.shop_id = None;
        self
    }

    pub fn route(self, method: Method, path: &str, response: ApiResponse) -> Self {
        self.push(method, path, response);
        self
    }

    pub fn push(&self, method: Method, path: &str, response: ApiResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: Method, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.path == path)
            .count()
    }
}

#[async_trait::async_trait]
impl ApiTransport for ScriptedTransport {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&JsonValue>,
    ) -> Result<ApiResponse, ApiError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.clone(),
            path: endpoint.to_string(),
            body: body.cloned(),
        });

        let mut routes = self.routes.lock().unwrap();
        let response = match routes.get_mut(&(method, endpoint.to_string())) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| ApiResponse::failed(Some(404), "no such route")))
    }

    fn shop_id(&self) -> Result<String, ApiError> {
        self.shop_id
            .clone()
            .ok_or_else(|| ApiError::Configuration("shop id is not set".to_string()))
    }
}
