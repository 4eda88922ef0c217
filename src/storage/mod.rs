//! Storage contract for idempotency records.
//!
//! All mutation of shared state flows through a [`StorageAdapter`].
//! Implementations must be linearizable per key across every operation
//! and must treat expired records as absent even before cleanup runs.

pub mod file;
pub mod memory;

use crate::config::{IdempotencyConfig, StorageBackend};
use crate::error::Result;
use crate::models::{IdempotencyRecord, LeaseResult, StoredResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Outcome of a `complete`/`fail` transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// The record transitioned to its terminal state.
    Applied,
    /// The token matches no live record (expired, superseded, or never
    /// issued). Nothing changed.
    UnknownLease,
    /// The record already reached a terminal state; this is an
    /// idempotent retry. Nothing changed.
    WrongState,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Returns the record under `key` if one exists and is unexpired.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Atomically reserves `key`: if no unexpired record exists, writes
    /// a RUNNING record with a fresh lease and returns it as acquired;
    /// otherwise returns the existing record. An expired record is
    /// shadowed by the new lease.
    async fn put_new_running(
        &self,
        key: &str,
        fingerprint: &str,
        ttl_seconds: u64,
        trace_id: Option<&str>,
    ) -> Result<LeaseResult>;

    /// Transitions the RUNNING record owned by `lease_token` to
    /// COMPLETED, storing the response and clearing the lease.
    async fn complete(
        &self,
        lease_token: Uuid,
        response: StoredResponse,
    ) -> Result<CompleteOutcome>;

    /// As `complete`, but the terminal state is FAILED.
    async fn fail(&self, lease_token: Uuid, response: StoredResponse) -> Result<CompleteOutcome>;

    /// Removes every record with `expires_at <= now`; returns the count.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Builds the configured storage backend.
pub async fn build_store(config: &IdempotencyConfig) -> Result<Arc<dyn StorageAdapter>> {
    match config.storage_backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File => {
            let store = FileStore::open(&config.file_storage_path).await?;
            Ok(Arc::new(store))
        }
    }
}
