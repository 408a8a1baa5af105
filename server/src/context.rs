//! Request context provision.
//!
//! Transports hand the server a [`RawRequest`] snapshot; the configured
//! provider turns it into the context value authorization policies and
//! custom mutations see. Policies must stay pure over `(ctx, value)`, so
//! everything they need has to be resolved here.

use crate::error::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Context handed to policies and custom mutations.
pub type Context = serde_json::Value;

/// Transport-agnostic request information.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    /// Lower-cased header name to value
    pub headers: HashMap<String, String>,
}

impl RawRequest {
    /// Snapshot the relevant parts of an HTTP header map.
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self { headers }
    }

    /// The Bearer token from the `Authorization` header, if present.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get("authorization")?
            .strip_prefix("Bearer ")
            .filter(|token| !token.is_empty())
    }
}

/// Async provider resolving a [`RawRequest`] into a [`Context`].
pub type ContextProvider =
    Arc<dyn Fn(RawRequest) -> BoxFuture<'static, Result<Context>> + Send + Sync>;

/// Default provider: exposes the Bearer token as `{"token": "..."}`, or
/// `null` for anonymous requests.
pub fn bearer_context_provider() -> ContextProvider {
    Arc::new(|raw| {
        Box::pin(async move {
            Ok(match raw.bearer_token() {
                Some(token) => serde_json::json!({ "token": token }),
                None => serde_json::Value::Null,
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[tokio::test]
    async fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer tok-1"));
        let raw = RawRequest::from_headers(&headers);
        assert_eq!(raw.bearer_token(), Some("tok-1"));

        let provider = bearer_context_provider();
        let ctx = provider(raw).await.unwrap();
        assert_eq!(ctx["token"], serde_json::json!("tok-1"));
    }

    #[tokio::test]
    async fn missing_or_malformed_auth_is_anonymous() {
        let raw = RawRequest::default();
        assert_eq!(raw.bearer_token(), None);

        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic abc"));
        let raw = RawRequest::from_headers(&headers);
        assert_eq!(raw.bearer_token(), None);

        let provider = bearer_context_provider();
        let ctx = provider(raw).await.unwrap();
        assert!(ctx.is_null());
    }
}
