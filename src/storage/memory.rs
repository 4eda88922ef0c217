//! In-process store with per-key lease serialization.
//!
//! A coarse `parking_lot::Mutex` guards the record map and the lease
//! index; it is never held across an await point. Lease acquisition is
//! additionally ordered by a per-key async mutex so concurrent
//! admissions for the same key queue instead of spinning on the coarse
//! lock. Per-key mutexes outlive their records and are reclaimed by
//! `cleanup_expired` once no waiter holds a clone.

use crate::error::Result;
use crate::models::{IdempotencyRecord, LeaseResult, RequestState, StoredResponse};
use crate::storage::{CompleteOutcome, StorageAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    records: HashMap<String, IdempotencyRecord>,
    /// Lease token to key. Entries outlive the RUNNING state so a
    /// retried `complete` reports `WrongState` instead of
    /// `UnknownLease`; they are dropped with the record.
    leases: HashMap<Uuid, String>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn transition(
        &self,
        lease_token: Uuid,
        response: StoredResponse,
        to_state: RequestState,
    ) -> CompleteOutcome {
        let mut inner = self.inner.lock();
        let Some(key) = inner.leases.get(&lease_token).cloned() else {
            return CompleteOutcome::UnknownLease;
        };

        let now = Utc::now();
        match inner.records.get_mut(&key) {
            None => {
                inner.leases.remove(&lease_token);
                CompleteOutcome::UnknownLease
            }
            Some(record) if record.is_expired_at(now) => CompleteOutcome::UnknownLease,
            Some(record) if record.state.is_terminal() => CompleteOutcome::WrongState,
            Some(record) if record.lease_token == Some(lease_token) => {
                record.state = to_state;
                record.response = Some(response);
                record.lease_token = None;
                CompleteOutcome::Applied
            }
            Some(_) => {
                // The record was superseded by a newer lease.
                inner.leases.remove(&lease_token);
                CompleteOutcome::UnknownLease
            }
        }
    }

    /// Number of live (possibly expired, not yet swept) records.
    #[cfg(test)]
    fn record_count(&self) -> usize {
        self.inner.lock().records.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let inner = self.inner.lock();
        Ok(inner.records.get(key).filter(|r| !r.is_expired()).cloned())
    }

    async fn put_new_running(
        &self,
        key: &str,
        fingerprint: &str,
        ttl_seconds: u64,
        trace_id: Option<&str>,
    ) -> Result<LeaseResult> {
        // Fast path without the per-key lock.
        {
            let inner = self.inner.lock();
            if let Some(existing) = inner.records.get(key) {
                if !existing.is_expired() {
                    return Ok(LeaseResult::Existing {
                        record: existing.clone(),
                    });
                }
            }
        }

        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.records.get(key) {
            if !existing.is_expired() {
                return Ok(LeaseResult::Existing {
                    record: existing.clone(),
                });
            }
            // Shadow the expired record and invalidate its lease.
            inner.records.remove(key);
            let shadowed = key.to_string();
            inner.leases.retain(|_, k| *k != shadowed);
        }

        let (record, lease_token) = IdempotencyRecord::new_running(
            key,
            fingerprint,
            ttl_seconds,
            trace_id.map(str::to_string),
        );
        inner.leases.insert(lease_token, key.to_string());
        inner.records.insert(key.to_string(), record);
        Ok(LeaseResult::Acquired { lease_token })
    }

    async fn complete(
        &self,
        lease_token: Uuid,
        response: StoredResponse,
    ) -> Result<CompleteOutcome> {
        Ok(self.transition(lease_token, response, RequestState::Completed))
    }

    async fn fail(&self, lease_token: Uuid, response: StoredResponse) -> Result<CompleteOutcome> {
        Ok(self.transition(lease_token, response, RequestState::Failed))
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut locks = self.key_locks.lock();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .records
            .iter()
            .filter(|(_, record)| record.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.records.remove(key);
        }

        let Inner { records, leases } = &mut *inner;
        leases.retain(|_, key| records.contains_key(key));

        // Reclaim per-key mutexes whose record is gone, unless a waiter
        // still holds a clone.
        locks.retain(|key, lock| records.contains_key(key) || Arc::strong_count(lock) > 1);

        Ok(expired.len())
    }
}
