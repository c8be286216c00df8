//! In-process response cache.
//!
//! Successful GET responses are kept for a fixed TTL, keyed by path and query
//! string. The store only changes when the parser runs, so a short TTL is
//! enough to absorb bursts of identical requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedResponse {
    stored_at: Instant,
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ResponseCache {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<String, CachedResponse>>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get(&self, key: &str) -> Option<CachedResponse> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .cloned()
    }

    async fn put(&self, key: String, entry: CachedResponse) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        entries.insert(key, entry);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn cache_key(request: &Request) -> String {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string())
}

fn replay(entry: CachedResponse) -> Response {
    let mut response = (entry.status, entry.body).into_response();
    if let Some(content_type) = entry.content_type {
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    }
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("HIT"));
    response
}

/// Middleware: serve from the cache when fresh, otherwise run the handler and
/// keep its response if it succeeded.
pub async fn cache_responses(State(cache): State<ResponseCache>, request: Request, next: Next) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }
    let key = cache_key(&request);
    if let Some(entry) = cache.get(&key).await {
        debug!("Cache hit {}", key);
        return replay(entry);
    }

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }
    let (parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Could not buffer response for {}: {}", key, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    cache
        .put(
            key,
            CachedResponse {
                stored_at: Instant::now(),
                status: parts.status,
                content_type: parts.headers.get(header::CONTENT_TYPE).cloned(),
                body: body.clone(),
            },
        )
        .await;
    Response::from_parts(parts, Body::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &'static str) -> CachedResponse {
        CachedResponse {
            stored_at: Instant::now(),
            status: StatusCode::OK,
            content_type: Some(HeaderValue::from_static("application/json")),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_fresh_entry_is_served() {
        let cache = ResponseCache::new(Duration::from_secs(30));
        cache.put("/years".into(), entry("[2015]")).await;
        let hit = cache.get("/years").await.unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"[2015]"));
        assert!(cache.get("/years?x=1").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let cache = ResponseCache::new(Duration::ZERO);
        cache.put("/a".into(), entry("1")).await;
        assert!(cache.get("/a").await.is_none());
        cache.put("/b".into(), entry("2")).await;
        assert_eq!(cache.len().await, 1);
    }

    #[test]
    fn test_key_includes_query() {
        let request = axum::http::Request::builder()
            .uri("/observations/ODB?level=SUBINDEX")
            .body(Body::empty())
            .unwrap();
        assert_eq!(cache_key(&request), "/observations/ODB?level=SUBINDEX");
    }

    #[test]
    fn test_replay_marks_hit() {
        let response = replay(entry("{}"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-cache"], "HIT");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }
}
