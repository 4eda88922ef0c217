//! File-backed store: one JSON document per key.
//!
//! Records are stored under `<root>/<sha256(key)>.json` in the
//! serialized record shape (RFC 3339 timestamps, base64 body, the
//! execution time lifted to the record's top level). Writes go through
//! a temp file and an atomic rename. A single async mutex serializes
//! mutations; the lease index is rebuilt from disk on open.

use crate::error::{AppError, Result};
use crate::models::{IdempotencyRecord, LeaseResult, RequestState, StoredResponse};
use crate::storage::{CompleteOutcome, StorageAdapter};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// On-disk record shape.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    key: String,
    fingerprint: String,
    state: RequestState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<PersistedResponse>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_token: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body_b64: String,
}

impl From<IdempotencyRecord> for PersistedRecord {
    fn from(record: IdempotencyRecord) -> Self {
        let execution_time_ms = record.response.as_ref().map(|r| r.execution_time_ms);
        Self {
            key: record.key,
            fingerprint: record.fingerprint,
            state: record.state,
            response: record.response.map(|r| PersistedResponse {
                status: r.status,
                headers: r.headers,
                body_b64: BASE64.encode(&r.body),
            }),
            created_at: record.created_at,
            expires_at: record.expires_at,
            execution_time_ms,
            lease_token: record.lease_token,
            trace_id: record.trace_id,
        }
    }
}

impl PersistedRecord {
    fn into_record(self) -> Result<IdempotencyRecord> {
        let execution_time_ms = self.execution_time_ms.unwrap_or(0);
        let response = match self.response {
            Some(persisted) => {
                let body = BASE64.decode(persisted.body_b64.as_bytes()).map_err(|e| {
                    AppError::storage(format!("corrupt body encoding for key {}: {e}", self.key))
                })?;
                Some(StoredResponse {
                    status: persisted.status,
                    headers: persisted.headers,
                    body,
                    execution_time_ms,
                })
            }
            None => None,
        };
        Ok(IdempotencyRecord {
            key: self.key,
            fingerprint: self.fingerprint,
            state: self.state,
            response,
            created_at: self.created_at,
            expires_at: self.expires_at,
            lease_token: self.lease_token,
            trace_id: self.trace_id,
        })
    }
}

pub struct FileStore {
    root: PathBuf,
    state: Mutex<FileState>,
}

struct FileState {
    /// Lease token to key, rebuilt from RUNNING records on open.
    leases: HashMap<Uuid, String>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root` and rebuilds
    /// the lease index from any RUNNING records left on disk.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| AppError::storage(format!("create {}: {e}", root.display())))?;

        let mut leases = HashMap::new();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| AppError::storage(format!("scan {}: {e}", root.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::storage(format!("scan {}: {e}", root.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_persisted(&path).await {
                Ok(Some(persisted)) => {
                    if let Some(token) = persisted.lease_token {
                        if persisted.state == RequestState::Running
                            && persisted.expires_at > Utc::now()
                        {
                            leases.insert(token, persisted.key);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record");
                }
            }
        }

        Ok(Self {
            root,
            state: Mutex::new(FileState { leases }),
        })
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", hex::encode(Sha256::digest(key.as_bytes()))))
    }

    async fn read_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        match read_persisted(&self.record_path(key)).await? {
            Some(persisted) => Ok(Some(persisted.into_record()?)),
            None => Ok(None),
        }
    }

    async fn write_record(&self, record: IdempotencyRecord) -> Result<()> {
        let path = self.record_path(&record.key);
        let persisted = PersistedRecord::from(record);
        let payload = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| AppError::storage(format!("serialize record: {e}")))?;

        let tmp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| AppError::storage(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AppError::storage(format!("rename to {}: {e}", path.display())))?;
        Ok(())
    }

    async fn transition(
        &self,
        lease_token: Uuid,
        response: StoredResponse,
        to_state: RequestState,
    ) -> Result<CompleteOutcome> {
        let mut state = self.state.lock().await;
        let Some(key) = state.leases.get(&lease_token).cloned() else {
            return Ok(CompleteOutcome::UnknownLease);
        };

        let Some(mut record) = self.read_record(&key).await? else {
            state.leases.remove(&lease_token);
            return Ok(CompleteOutcome::UnknownLease);
        };
        if record.is_expired() {
            return Ok(CompleteOutcome::UnknownLease);
        }
        if record.state.is_terminal() {
            return Ok(CompleteOutcome::WrongState);
        }
        if record.lease_token != Some(lease_token) {
            state.leases.remove(&lease_token);
            return Ok(CompleteOutcome::UnknownLease);
        }

        record.state = to_state;
        record.response = Some(response);
        record.lease_token = None;
        self.write_record(record).await?;
        Ok(CompleteOutcome::Applied)
    }
}

async fn read_persisted(path: &Path) -> Result<Option<PersistedRecord>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AppError::storage(format!("read {}: {e}", path.display()))),
    };
    let persisted = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::storage(format!("parse {}: {e}", path.display())))?;
    Ok(Some(persisted))
}

#[async_trait]
impl StorageAdapter for FileStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let _state = self.state.lock().await;
        Ok(self.read_record(key).await?.filter(|r| !r.is_expired()))
    }

    async fn put_new_running(
        &self,
        key: &str,
        fingerprint: &str,
        ttl_seconds: u64,
        trace_id: Option<&str>,
    ) -> Result<LeaseResult> {
        let mut state = self.state.lock().await;

        if let Some(existing) = self.read_record(key).await? {
            if !existing.is_expired() {
                return Ok(LeaseResult::Existing { record: existing });
            }
            // Shadowing an expired record invalidates its lease.
            let shadowed = key.to_string();
            state.leases.retain(|_, k| *k != shadowed);
        }

        let (record, lease_token) = IdempotencyRecord::new_running(
            key,
            fingerprint,
            ttl_seconds,
            trace_id.map(str::to_string),
        );
        self.write_record(record).await?;
        state.leases.insert(lease_token, key.to_string());
        Ok(LeaseResult::Acquired { lease_token })
    }

    async fn complete(
        &self,
        lease_token: Uuid,
        response: StoredResponse,
    ) -> Result<CompleteOutcome> {
        self.transition(lease_token, response, RequestState::Completed)
            .await
    }

    async fn fail(&self, lease_token: Uuid, response: StoredResponse) -> Result<CompleteOutcome> {
        self.transition(lease_token, response, RequestState::Failed)
            .await
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock().await;

        let mut removed_keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| AppError::storage(format!("scan {}: {e}", self.root.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::storage(format!("scan {}: {e}", self.root.display())))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let persisted = match read_persisted(&path).await {
                Ok(Some(persisted)) => persisted,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record");
                    continue;
                }
            };
            if persisted.expires_at <= now {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != ErrorKind::NotFound {
                        return Err(AppError::storage(format!(
                            "remove {}: {e}",
                            path.display()
                        )));
                    }
                }
                removed_keys.push(persisted.key);
            }
        }

        state.leases.retain(|_, key| !removed_keys.contains(key));
        Ok(removed_keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn response() -> StoredResponse {
        StoredResponse::new(
            201,
            vec![("content-type".to_string(), "application/json".to_string())],
            b"{\"id\":\"p-1\"}".to_vec(),
            42,
        )
    }

    #[tokio::test]
    async fn test_persisted_shape() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let token = match store
            .put_new_running("k1", &"a".repeat(64), 60, Some("trace-1"))
            .await
            .unwrap()
        {
            LeaseResult::Acquired { lease_token } => lease_token,
            LeaseResult::Existing { .. } => panic!("expected acquisition"),
        };
        store.complete(token, response()).await.unwrap();

        let raw = std::fs::read_to_string(store.record_path("k1")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["key"], "k1");
        assert_eq!(json["state"], "COMPLETED");
        assert_eq!(json["execution_time_ms"], 42);
        assert_eq!(json["response"]["status"], 201);
        assert_eq!(json["response"]["body_b64"], "eyJpZCI6InAtMSJ9");
        assert!(json.get("lease_token").is_none());
        // RFC 3339 UTC timestamps.
        let created = json["created_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(created).is_ok());
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_lease_index() {
        let dir = TempDir::new().unwrap();
        let token = {
            let store = FileStore::open(dir.path()).await.unwrap();
            match store
                .put_new_running("k1", &"a".repeat(64), 60, None)
                .await
                .unwrap()
            {
                LeaseResult::Acquired { lease_token } => lease_token,
                LeaseResult::Existing { .. } => panic!("expected acquisition"),
            }
        };

        // A new process over the same directory can finish the request.
        let reopened = FileStore::open(dir.path()).await.unwrap();
        let outcome = reopened.complete(token, response()).await.unwrap();
        assert_eq!(outcome, CompleteOutcome::Applied);

        let record = reopened.get("k1").await.unwrap().unwrap();
        assert_eq!(record.state, RequestState::Completed);
        assert!(record.lease_token.is_none());
    }

    #[tokio::test]
    async fn test_record_path_is_stable_and_key_safe() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        // Keys with path-hostile characters never touch the filesystem
        // layout; the file name is a digest.
        let path = store.record_path("../../etc/passwd");
        assert!(path.starts_with(dir.path()));
        assert_eq!(path, store.record_path("../../etc/passwd"));
        assert_ne!(path, store.record_path("other"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store
            .put_new_running("k1", &"a".repeat(64), 60, None)
            .await
            .unwrap();

        assert_eq!(store.cleanup_expired(Utc::now()).await.unwrap(), 0);
        let removed = store
            .cleanup_expired(Utc::now() + chrono::Duration::seconds(120))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.record_path("k1").exists());
    }
}
