use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use idemgate::config::IdempotencyConfig;
use idemgate::http::idempotency_middleware;
use idemgate::middleware::IdempotencyMiddleware;
use idemgate::storage::{MemoryStore, StorageAdapter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// A demo service bound to an ephemeral port, wrapped in the
/// idempotency middleware. The counter tracks handler invocations so
/// tests can assert single-flight behavior.
pub struct TestApp {
    pub addr: SocketAddr,
    counter: Arc<AtomicUsize>,
    shutdown: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn invocations(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

pub async fn spawn_app(config: IdempotencyConfig) -> TestApp {
    spawn_app_with_store(config, Arc::new(MemoryStore::new())).await
}

pub async fn spawn_app_with_store(
    config: IdempotencyConfig,
    store: Arc<dyn StorageAdapter>,
) -> TestApp {
    async fn create_payment(
        State(counter): State<Arc<AtomicUsize>>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let invocation = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": format!("p-{invocation}"),
                "amount": body.get("amount").cloned().unwrap_or(serde_json::Value::Null),
            })),
        )
    }

    async fn slow_payment(
        State(counter): State<Arc<AtomicUsize>>,
        Json(_): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        (
            StatusCode::OK,
            Json(serde_json::json!({"status": "done"})),
        )
    }

    async fn failing_payment(
        State(counter): State<Arc<AtomicUsize>>,
    ) -> (StatusCode, &'static str) {
        counter.fetch_add(1, Ordering::SeqCst);
        (StatusCode::BAD_GATEWAY, "upstream processor unavailable")
    }

    async fn health() -> StatusCode {
        StatusCode::OK
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let config = Arc::new(config);
    let middleware = Arc::new(IdempotencyMiddleware::new(store, config));

    let app = Router::new()
        .route("/api/payments", post(create_payment))
        .route("/api/slow", post(slow_payment))
        .route("/api/fail", post(failing_payment))
        .route("/health", get(health))
        .layer(axum::middleware::from_fn_with_state(
            middleware,
            idempotency_middleware,
        ))
        .with_state(counter.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    TestApp {
        addr,
        counter,
        shutdown: shutdown_tx,
        handle,
    }
}
