use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use idemgate::cleanup::CleanupTask;
use idemgate::config::{IdempotencyConfig, Settings};
use idemgate::http::idempotency_middleware;
use idemgate::middleware::IdempotencyMiddleware;
use idemgate::observability::{init_logging, init_metrics, LogFormat};
use idemgate::storage::build_store;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

/// State for the demo payment endpoints.
#[derive(Clone)]
struct AppState {
    metrics_handle: PrometheusHandle,
}

#[derive(Debug, Deserialize)]
struct CreatePaymentRequest {
    amount: i64,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Serialize)]
struct PaymentResponse {
    id: String,
    amount: i64,
    currency: String,
    created_at: DateTime<Utc>,
}

/// Demo handler with a side effect worth deduplicating.
async fn create_payment(
    Json(request): Json<CreatePaymentRequest>,
) -> (StatusCode, Json<PaymentResponse>) {
    let payment = PaymentResponse {
        id: format!("pay_{}", Uuid::new_v4().simple()),
        amount: request.amount,
        currency: request.currency.unwrap_or_else(|| "USD".to_string()),
        created_at: Utc::now(),
    };
    info!(payment_id = %payment.id, amount = payment.amount, "payment created");
    (StatusCode::CREATED, Json(payment))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new()?;
    init_logging(&settings.log_level, LogFormat::parse(&settings.log_format));

    let metrics_handle = init_metrics()?;

    let idempotency_config = Arc::new(IdempotencyConfig::load()?);
    info!(
        backend = ?idempotency_config.storage_backend,
        wait_policy = %idempotency_config.wait_policy,
        ttl_seconds = idempotency_config.default_ttl_seconds,
        "Idempotency configuration loaded"
    );

    let store = build_store(&idempotency_config).await?;
    let middleware = Arc::new(IdempotencyMiddleware::new(
        store.clone(),
        idempotency_config.clone(),
    ));

    let cleanup = CleanupTask::spawn(
        store,
        Duration::from_secs(idempotency_config.cleanup_interval_seconds),
    );

    let state = AppState { metrics_handle };
    let app = Router::new()
        .route("/api/payments", post(create_payment))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(axum::middleware::from_fn_with_state(
            middleware,
            idempotency_middleware,
        ))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", settings.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    cleanup.shutdown().await;
    info!("Server stopped");

    Ok(())
}
