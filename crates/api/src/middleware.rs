use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::app::errors::json_error;

/// Static bearer token guarding the operator endpoints.
#[derive(Clone)]
pub struct AdminAuth {
    token: Option<Arc<str>>,
}

impl AdminAuth {
    /// An empty or missing token locks the operator endpoints entirely.
    pub fn new(token: Option<String>) -> Self {
        let token = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Arc::from);
        if token.is_none() {
            tracing::warn!("ADMIN_TOKEN not set; admin endpoints will reject every request");
        }
        Self { token }
    }

    fn accepts(&self, presented: &str) -> bool {
        self.token
            .as_deref()
            .is_some_and(|expected| expected == presented)
    }
}

impl std::fmt::Debug for AdminAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAuth")
            .field("configured", &self.token.is_some())
            .finish()
    }
}

pub async fn admin_auth_middleware(
    State(auth): State<AdminAuth>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let authorized = extract_bearer(req.headers()).is_ok_and(|token| auth.accepts(token));
    if !authorized {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        ));
    }
    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_tokens_are_extracted() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), Err(StatusCode::UNAUTHORIZED));

        headers.insert("authorization", HeaderValue::from_static("Bearer  s3cret "));
        assert_eq!(extract_bearer(&headers), Ok("s3cret"));
    }

    #[test]
    fn unset_tokens_accept_nothing() {
        assert!(!AdminAuth::new(None).accepts(""));
        assert!(!AdminAuth::new(Some("  ".to_string())).accepts(""));
        assert!(AdminAuth::new(Some("s3cret".to_string())).accepts("s3cret"));
    }
}
