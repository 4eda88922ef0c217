//! Prometheus metrics for the idempotency layer.
//!
//! Metric family:
//! - `idempotency_requests_total{result,status}` — admission outcomes
//!   (`new`, `replay`, `conflict`, `bad_key`, `too_large`, `error`)
//! - `idempotency_execution_time_ms` — handler time, new executions only
//! - `idempotency_active_keys` — keys currently RUNNING
//! - `idempotency_cleanup_operations_total` /
//!   `idempotency_cleanup_records_removed_total` — sweeper activity

use crate::error::{AppError, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the Prometheus recorder and registers metric descriptions.
/// Call once at startup; the handle renders the `/metrics` payload.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("install metrics recorder: {e}")))?;

    describe_counter!(
        "idempotency_requests_total",
        "Requests processed by the idempotency middleware, by result and status"
    );
    describe_histogram!(
        "idempotency_execution_time_ms",
        "Handler execution time in milliseconds (new executions only)"
    );
    describe_gauge!(
        "idempotency_active_keys",
        "Idempotency keys currently in RUNNING state"
    );
    describe_counter!(
        "idempotency_cleanup_operations_total",
        "Cleanup sweeps performed"
    );
    describe_counter!(
        "idempotency_cleanup_records_removed_total",
        "Expired records removed by cleanup"
    );

    Ok(handle)
}

/// Records a processed request by result type and response status.
pub fn record_request(result: &str, status: u16) {
    counter!(
        "idempotency_requests_total",
        "result" => result.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Records handler execution time; replays are not counted.
pub fn record_execution_time(execution_time_ms: u64) {
    histogram!("idempotency_execution_time_ms").record(execution_time_ms as f64);
}

pub fn increment_active_keys() {
    gauge!("idempotency_active_keys").increment(1.0);
}

pub fn decrement_active_keys() {
    gauge!("idempotency_active_keys").decrement(1.0);
}

/// Records one cleanup sweep and how many records it removed.
pub fn record_cleanup(records_removed: usize) {
    counter!("idempotency_cleanup_operations_total").increment(1);
    counter!("idempotency_cleanup_records_removed_total").increment(records_removed as u64);
}
