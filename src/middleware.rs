//! Admission and dispatch: validates the key, short-circuits safe
//! methods, bounds body size, and delegates to the state engine.
//!
//! The middleware is framework-agnostic: adapters convert their native
//! request shape into [`HttpRequest`] and hand over an async closure
//! that runs the downstream handler with the rebuffered body.

use crate::config::IdempotencyConfig;
use crate::error::{AppError, Result};
use crate::fingerprint::compute_fingerprint;
use crate::headers::{get_header_value, IDEMPOTENCY_KEY};
use crate::models::validate_key;
use crate::observability::logging::mask_key;
use crate::observability::metrics;
use crate::replay::HandlerResponse;
use crate::state_machine::StateEngine;
use crate::storage::StorageAdapter;
use std::future::Future;
use std::sync::Arc;

/// Header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Optional header requesting a record TTL, clamped by configuration.
pub const IDEMPOTENCY_TTL_HEADER: &str = "idempotency-ttl";

/// Headers probed, in order, for a trace correlation id.
const TRACE_HEADERS: &[&str] = &["x-request-id", "x-trace-id", "traceparent"];

/// Normalized request shape handed to the middleware by an adapter.
/// The body arrives fully buffered; the middleware enforces the byte
/// cap itself, after key validation and before fingerprinting.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct IdempotencyMiddleware {
    engine: StateEngine,
    config: Arc<IdempotencyConfig>,
}

impl IdempotencyMiddleware {
    pub fn new(store: Arc<dyn StorageAdapter>, config: Arc<IdempotencyConfig>) -> Self {
        Self {
            engine: StateEngine::new(store, Arc::clone(&config)),
            config,
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Processes one request. `handler` runs the downstream handler
    /// against the (rebuffered) request and is invoked at most once:
    /// directly for pass-through traffic, through the state engine for
    /// idempotency-eligible traffic.
    pub async fn process<F, Fut>(&self, request: &HttpRequest, handler: F) -> HandlerResponse
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<HandlerResponse>> + Send + 'static,
    {
        if !self.config.method_enabled(&request.method) {
            return pass_through(handler).await;
        }

        let Some(key) = get_header_value(&request.headers, IDEMPOTENCY_KEY_HEADER)
            .map(|value| value.trim().to_string())
        else {
            return pass_through(handler).await;
        };

        if let Err(e) = validate_key(&key) {
            tracing::warn!(error = %e, "rejecting malformed idempotency key");
            metrics::record_request("bad_key", 422);
            // The key is untrusted here; it is not echoed back.
            return HandlerResponse::text(422, format!("Invalid idempotency key: {e}"));
        }

        if self.config.max_body_bytes > 0 && request.body.len() > self.config.max_body_bytes {
            metrics::record_request("too_large", 413);
            return HandlerResponse::text(
                413,
                format!(
                    "Request body exceeds maximum of {} bytes",
                    self.config.max_body_bytes
                ),
            )
            .with_header(IDEMPOTENCY_KEY, key);
        }

        let fingerprint = compute_fingerprint(
            &request.method,
            &request.path,
            &request.query_string,
            &request.headers,
            &request.body,
            &self.config.fingerprint_headers,
        );
        let trace_id = extract_trace_id(&request.headers);
        let ttl_seconds = self
            .config
            .effective_ttl_seconds(requested_ttl(&request.headers));

        tracing::debug!(
            key = %mask_key(&key),
            fingerprint = %fingerprint,
            trace_id = ?trace_id,
            ttl_seconds,
            "admitting idempotent request"
        );

        match self
            .engine
            .process(&key, &fingerprint, ttl_seconds, trace_id, handler)
            .await
        {
            Ok(outcome) => {
                let result = if outcome.was_replayed { "replay" } else { "new" };
                metrics::record_request(result, outcome.response.status);
                outcome.response
            }
            Err(AppError::Conflict { key, .. }) => {
                tracing::info!(key = %mask_key(&key), "fingerprint conflict");
                metrics::record_request("conflict", 409);
                HandlerResponse::text(
                    409,
                    "Request conflict: idempotency key reused with a different request fingerprint",
                )
                .with_header(IDEMPOTENCY_KEY, key)
            }
            Err(e) => {
                tracing::error!(key = %mask_key(&key), error = %e, "idempotency processing failed");
                metrics::record_request("error", 500);
                HandlerResponse::text(500, "Idempotency processing failed")
                    .with_header(IDEMPOTENCY_KEY, key)
            }
        }
    }
}

async fn pass_through<F, Fut>(handler: F) -> HandlerResponse
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HandlerResponse>>,
{
    match handler().await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(error = %e, "pass-through handler failed");
            HandlerResponse::text(500, "Internal error")
        }
    }
}

fn extract_trace_id(headers: &[(String, String)]) -> Option<String> {
    TRACE_HEADERS.iter().find_map(|name| {
        get_header_value(headers, name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    })
}

fn requested_ttl(headers: &[(String, String)]) -> Option<u64> {
    get_header_value(headers, IDEMPOTENCY_TTL_HEADER)?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestState;
    use crate::storage::MemoryStore;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type BoxedHandler =
        Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<HandlerResponse>> + Send>> + Send>;

    fn counting(counter: Arc<AtomicUsize>, status: u16) -> BoxedHandler {
        Box::new(move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerResponse::new(
                    status,
                    vec![("content-type".to_string(), "application/json".to_string())],
                    b"{\"id\":\"p-1\"}".to_vec(),
                ))
            })
        })
    }

    fn middleware(config: IdempotencyConfig) -> (IdempotencyMiddleware, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mw = IdempotencyMiddleware::new(store.clone(), Arc::new(config));
        (mw, store)
    }

    fn request(method: &str, key: Option<&str>, body: &[u8]) -> HttpRequest {
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = key {
            headers.push((IDEMPOTENCY_KEY_HEADER.to_string(), key.to_string()));
        }
        HttpRequest {
            method: method.to_string(),
            path: "/api/payments".to_string(),
            query_string: String::new(),
            headers,
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_safe_method_passes_through() {
        let (mw, store) = middleware(IdempotencyConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("GET", Some("k1"), b"");
        let response = mw.process(&req, counting(counter.clone(), 200)).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.header(IDEMPOTENCY_KEY), None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(store.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_key_passes_through() {
        let (mw, _store) = middleware(IdempotencyConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", None, b"{}");
        let response = mw.process(&req, counting(counter.clone(), 201)).await;

        assert_eq!(response.status, 201);
        assert_eq!(response.header(IDEMPOTENCY_KEY), None);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_is_422() {
        let (mw, store) = middleware(IdempotencyConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        for bad_key in ["\r\n", "key\u{7f}", &"x".repeat(256)] {
            let req = request("POST", Some(bad_key), b"{}");
            let response = mw.process(&req, counting(counter.clone(), 201)).await;
            assert_eq!(response.status, 422);
            assert_eq!(response.header(IDEMPOTENCY_KEY), None);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(store.get("\r\n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_key_wins_over_oversized_body() {
        // Admission rules apply in order: a bad key is rejected with
        // 422 even when the body also exceeds the cap.
        let config = IdempotencyConfig {
            max_body_bytes: 16,
            ..IdempotencyConfig::default()
        };
        let (mw, store) = middleware(config);
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", Some("\r\n"), &[b'x'; 32]);
        let response = mw.process(&req, counting(counter.clone(), 201)).await;

        assert_eq!(response.status, 422);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(store.get("\r\n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_413_with_no_store_write() {
        let config = IdempotencyConfig {
            max_body_bytes: 16,
            ..IdempotencyConfig::default()
        };
        let (mw, store) = middleware(config);
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", Some("k1"), &[b'x'; 17]);
        let response = mw.process(&req, counting(counter.clone(), 201)).await;

        assert_eq!(response.status, 413);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(store.get("k1").await.unwrap().is_none());

        // The cap rejection left no record: a retry under the limit
        // executes fresh instead of conflicting.
        let req = request("POST", Some("k1"), b"{}");
        let response = mw.process(&req, counting(counter.clone(), 201)).await;
        assert_eq!(response.status, 201);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_cap_disables_body_limit() {
        let config = IdempotencyConfig {
            max_body_bytes: 0,
            ..IdempotencyConfig::default()
        };
        let (mw, _store) = middleware(config);
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", Some("k1"), &vec![b'x'; 2_000_000]);
        let response = mw.process(&req, counting(counter.clone(), 201)).await;
        assert_eq!(response.status, 201);
    }

    #[tokio::test]
    async fn test_first_call_executes_and_annotates() {
        let (mw, _store) = middleware(IdempotencyConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", Some("k1"), b"{\"amount\":100}");
        let response = mw.process(&req, counting(counter.clone(), 201)).await;

        assert_eq!(response.status, 201);
        assert_eq!(response.header(IDEMPOTENCY_KEY), Some("k1"));
        assert_eq!(response.header("idempotent-replay"), None);
    }

    #[tokio::test]
    async fn test_duplicate_replays_and_conflict_rejects() {
        let (mw, _store) = middleware(IdempotencyConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", Some("k1"), b"{\"amount\":100}");
        mw.process(&req, counting(counter.clone(), 201)).await;

        let replayed = mw.process(&req, counting(counter.clone(), 201)).await;
        assert_eq!(replayed.status, 201);
        assert_eq!(replayed.header("idempotent-replay"), Some("true"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let conflicting = request("POST", Some("k1"), b"{\"amount\":200}");
        let conflict = mw.process(&conflicting, counting(counter.clone(), 201)).await;
        assert_eq!(conflict.status, 409);
        assert_eq!(conflict.header("idempotent-replay"), None);
        assert!(String::from_utf8_lossy(&conflict.body).contains("fingerprint"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_2xx_handler_response_is_cached_completed() {
        let (mw, store) = middleware(IdempotencyConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));

        let req = request("POST", Some("k1"), b"{}");
        let first = mw.process(&req, counting(counter.clone(), 422)).await;
        assert_eq!(first.status, 422);

        let record = store.get("k1").await.unwrap().unwrap();
        assert_eq!(record.state, RequestState::Completed);

        let replayed = mw.process(&req, counting(counter.clone(), 422)).await;
        assert_eq!(replayed.status, 422);
        assert_eq!(replayed.header("idempotent-replay"), Some("true"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_trace_id_extraction_order() {
        let headers = |pairs: &[(&str, &str)]| -> Vec<(String, String)> {
            pairs
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect()
        };

        assert_eq!(
            extract_trace_id(&headers(&[("x-request-id", "req-1"), ("x-trace-id", "tr-1")])),
            Some("req-1".to_string())
        );
        assert_eq!(
            extract_trace_id(&headers(&[("traceparent", "00-abc-def-01")])),
            Some("00-abc-def-01".to_string())
        );
        assert_eq!(extract_trace_id(&headers(&[("x-request-id", "  ")])), None);
        assert_eq!(extract_trace_id(&[]), None);
    }

    #[tokio::test]
    async fn test_requested_ttl_parsing() {
        let headers = vec![(IDEMPOTENCY_TTL_HEADER.to_string(), "3600".to_string())];
        assert_eq!(requested_ttl(&headers), Some(3600));

        let junk = vec![(IDEMPOTENCY_TTL_HEADER.to_string(), "soon".to_string())];
        assert_eq!(requested_ttl(&junk), None);
        assert_eq!(requested_ttl(&[]), None);
    }
}
