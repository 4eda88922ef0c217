//! Per-key state machine: `NEW -> RUNNING -> COMPLETED | FAILED`.
//!
//! Decides, for an admitted request, whether to execute the handler,
//! replay a stored response, report a conflict, or signal in-progress.
//! For any set of concurrent admissions sharing a key, exactly one
//! acquires the lease and executes; the rest replay or wait.

use crate::config::{IdempotencyConfig, WaitPolicy};
use crate::error::{AppError, Result};
use crate::headers::{add_replay_headers, IDEMPOTENCY_KEY};
use crate::models::{IdempotencyRecord, LeaseResult, StoredResponse};
use crate::observability::logging::mask_key;
use crate::observability::metrics;
use crate::replay::{replay_response, HandlerResponse};
use crate::storage::{CompleteOutcome, StorageAdapter};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Result of driving a request through the state machine.
#[derive(Debug)]
pub struct EngineOutcome {
    pub response: HandlerResponse,
    /// True when the response came from a stored record rather than a
    /// handler invocation.
    pub was_replayed: bool,
}

enum WaitOutcome {
    Terminal(IdempotencyRecord),
    /// The RUNNING record expired mid-wait; the key is NEW again.
    Vanished,
    TimedOut,
}

enum ExecResult {
    Returned(Result<HandlerResponse>),
    Panicked(String),
    TimedOut,
}

pub struct StateEngine {
    store: Arc<dyn StorageAdapter>,
    config: Arc<IdempotencyConfig>,
}

impl StateEngine {
    pub fn new(store: Arc<dyn StorageAdapter>, config: Arc<IdempotencyConfig>) -> Self {
        Self { store, config }
    }

    /// Drives one admitted request. `handler` is invoked at most once,
    /// and only if this request wins the lease.
    pub async fn process<F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        ttl_seconds: u64,
        trace_id: Option<String>,
        handler: F,
    ) -> Result<EngineOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<HandlerResponse>> + Send + 'static,
    {
        let mut handler = Some(handler);

        loop {
            let existing = match self.store.get(key).await? {
                Some(record) => record,
                None => {
                    match self
                        .store
                        .put_new_running(key, fingerprint, ttl_seconds, trace_id.as_deref())
                        .await?
                    {
                        LeaseResult::Acquired { lease_token } => {
                            let Some(handler) = handler.take() else {
                                return Err(AppError::Internal(anyhow::anyhow!(
                                    "handler consumed twice for key {key}"
                                )));
                            };
                            return self.execute(key, lease_token, handler).await;
                        }
                        // Lost the race; fall through to the record the
                        // winner created.
                        LeaseResult::Existing { record } => record,
                    }
                }
            };

            if existing.state.is_terminal() {
                return self.finish_terminal(existing, key, fingerprint);
            }

            // RUNNING. The stored artifact-to-be belongs to whatever
            // fingerprint acquired the lease.
            if existing.fingerprint != fingerprint {
                return Err(AppError::Conflict {
                    key: key.to_string(),
                    stored_fingerprint: existing.fingerprint,
                    request_fingerprint: fingerprint.to_string(),
                });
            }

            match self.config.wait_policy {
                WaitPolicy::NoWait => return Ok(self.in_progress_outcome(&existing, key)),
                WaitPolicy::Wait => match self.wait_for_completion(key).await? {
                    WaitOutcome::Terminal(record) => {
                        return self.finish_terminal(record, key, fingerprint)
                    }
                    WaitOutcome::Vanished => continue,
                    WaitOutcome::TimedOut => return Ok(self.wait_timeout_outcome(key)),
                },
            }
        }
    }

    /// Runs the handler under the acquired lease and records the
    /// terminal state. The work happens in a detached task so that an
    /// upstream cancellation cannot leave the record RUNNING forever:
    /// the transition always lands before the task finishes.
    async fn execute<F, Fut>(
        &self,
        key: &str,
        lease_token: Uuid,
        handler: F,
    ) -> Result<EngineOutcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<HandlerResponse>> + Send + 'static,
    {
        metrics::increment_active_keys();

        let store = Arc::clone(&self.store);
        let key_owned = key.to_string();
        let exec_timeout = Duration::from_secs(self.config.execution_timeout_seconds);

        let worker = tokio::spawn(async move {
            let started = Instant::now();
            let mut inner = tokio::spawn(handler());
            let result = match tokio::time::timeout(exec_timeout, &mut inner).await {
                Ok(Ok(returned)) => ExecResult::Returned(returned),
                Ok(Err(join_err)) => ExecResult::Panicked(join_err.to_string()),
                Err(_) => {
                    inner.abort();
                    ExecResult::TimedOut
                }
            };
            let execution_time_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                ExecResult::Returned(Ok(response)) => {
                    let stored = StoredResponse::new(
                        response.status,
                        response.headers.clone(),
                        response.body.clone(),
                        execution_time_ms,
                    );
                    record_terminal(&store, &key_owned, lease_token, stored, true).await;
                    metrics::record_execution_time(execution_time_ms);
                    response
                }
                ExecResult::Returned(Err(err)) => {
                    tracing::warn!(key = %mask_key(&key_owned), error = %err, "handler returned an error");
                    capture_failure(
                        &store,
                        &key_owned,
                        lease_token,
                        format!("Internal error: {err}"),
                        execution_time_ms,
                    )
                    .await
                }
                ExecResult::Panicked(message) => {
                    tracing::error!(key = %mask_key(&key_owned), panic = %message, "handler panicked");
                    capture_failure(
                        &store,
                        &key_owned,
                        lease_token,
                        "Internal error: handler panicked".to_string(),
                        execution_time_ms,
                    )
                    .await
                }
                ExecResult::TimedOut => {
                    tracing::warn!(key = %mask_key(&key_owned), "handler execution timed out");
                    capture_failure(
                        &store,
                        &key_owned,
                        lease_token,
                        "Internal error: handler execution timed out".to_string(),
                        execution_time_ms,
                    )
                    .await
                }
            };

            metrics::decrement_active_keys();
            outcome
        });

        let mut response = match worker.await {
            Ok(response) => response,
            Err(join_err) => {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "execution task failed for key {key}: {join_err}"
                )))
            }
        };

        response.headers = add_replay_headers(std::mem::take(&mut response.headers), key, false);
        Ok(EngineOutcome {
            response,
            was_replayed: false,
        })
    }

    fn finish_terminal(
        &self,
        record: IdempotencyRecord,
        key: &str,
        fingerprint: &str,
    ) -> Result<EngineOutcome> {
        if record.fingerprint != fingerprint {
            return Err(AppError::Conflict {
                key: key.to_string(),
                stored_fingerprint: record.fingerprint,
                request_fingerprint: fingerprint.to_string(),
            });
        }
        let response = replay_response(&record, key, self.config.replay_strip_set_cookie)?;
        Ok(EngineOutcome {
            response,
            was_replayed: true,
        })
    }

    /// Polls the record until it turns terminal, vanishes (expiry), or
    /// the execution timeout elapses.
    async fn wait_for_completion(&self, key: &str) -> Result<WaitOutcome> {
        let deadline = Instant::now() + Duration::from_secs(self.config.execution_timeout_seconds);
        let poll_interval = Duration::from_millis(self.config.wait_poll_interval_ms);

        while Instant::now() < deadline {
            tokio::time::sleep(poll_interval).await;
            match self.store.get(key).await? {
                None => return Ok(WaitOutcome::Vanished),
                Some(record) if record.state.is_terminal() => {
                    return Ok(WaitOutcome::Terminal(record))
                }
                Some(_) => {}
            }
        }
        Ok(WaitOutcome::TimedOut)
    }

    fn in_progress_outcome(&self, record: &IdempotencyRecord, key: &str) -> EngineOutcome {
        let remaining = record.seconds_until_expiry(chrono::Utc::now());
        let retry_after = remaining
            .min(self.config.in_progress_retry_after_seconds)
            .max(1);
        let response = HandlerResponse::text(409, "Request is currently being processed")
            .with_header("retry-after", retry_after.to_string())
            .with_header(IDEMPOTENCY_KEY, key);
        EngineOutcome {
            response,
            was_replayed: false,
        }
    }

    fn wait_timeout_outcome(&self, key: &str) -> EngineOutcome {
        let response = HandlerResponse::text(
            self.config.wait_timeout_status_code,
            "Execution timeout - request still processing",
        )
        .with_header(
            "retry-after",
            self.config.in_progress_retry_after_seconds.to_string(),
        )
        .with_header(IDEMPOTENCY_KEY, key);
        EngineOutcome {
            response,
            was_replayed: false,
        }
    }
}

/// Records a FAILED artifact and returns the 500 handed to the caller.
async fn capture_failure(
    store: &Arc<dyn StorageAdapter>,
    key: &str,
    lease_token: Uuid,
    body: String,
    execution_time_ms: u64,
) -> HandlerResponse {
    let response = HandlerResponse::text(500, body);
    let stored = StoredResponse::new(
        500,
        response.headers.clone(),
        response.body.clone(),
        execution_time_ms,
    );
    record_terminal(store, key, lease_token, stored, false).await;
    response
}

/// Drives the RUNNING record to its terminal state. A rejected
/// transition is logged and swallowed: the caller still gets the
/// response it paid for, and the record owner (if any) wins.
async fn record_terminal(
    store: &Arc<dyn StorageAdapter>,
    key: &str,
    lease_token: Uuid,
    response: StoredResponse,
    completed: bool,
) {
    let result = if completed {
        store.complete(lease_token, response).await
    } else {
        store.fail(lease_token, response).await
    };

    match result {
        Ok(CompleteOutcome::Applied) => {}
        Ok(outcome) => {
            tracing::warn!(key = %mask_key(key), ?outcome, "terminal transition rejected by store");
        }
        Err(e) => {
            tracing::error!(key = %mask_key(key), error = %e, "failed to record terminal state");
        }
    }
}
