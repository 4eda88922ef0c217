use crate::error::{AppError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of an idempotency record. The absence of a record is the
/// implicit `NEW` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Running,
    Completed,
    Failed,
}

impl RequestState {
    /// Returns true if the record will never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

/// A captured handler outcome, replayable to later callers.
///
/// Header names are lowercased; pairs keep insertion order so
/// multi-valued headers replay in the order they were produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(rename = "body_b64", with = "base64_bytes")]
    pub body: Vec<u8>,
    pub execution_time_ms: u64,
}

impl StoredResponse {
    pub fn new(
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        execution_time_ms: u64,
    ) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            status,
            headers,
            body,
            execution_time_ms,
        }
    }
}

/// The unit stored under an idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    pub state: RequestState,
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lease_token: Option<Uuid>,
    pub trace_id: Option<String>,
}

impl IdempotencyRecord {
    /// Creates a fresh RUNNING record and returns it together with the
    /// lease token it holds.
    pub fn new_running(
        key: impl Into<String>,
        fingerprint: impl Into<String>,
        ttl_seconds: u64,
        trace_id: Option<String>,
    ) -> (Self, Uuid) {
        let lease_token = Uuid::new_v4();
        let now = Utc::now();
        let record = Self {
            key: key.into(),
            fingerprint: fingerprint.into(),
            state: RequestState::Running,
            response: None,
            created_at: now,
            expires_at: now + Duration::seconds(ttl_seconds.max(1) as i64),
            lease_token: Some(lease_token),
            trace_id,
        };
        (record, lease_token)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Seconds until this record expires, saturating at zero.
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

/// Outcome of an atomic lease reservation attempt.
#[derive(Debug, Clone)]
pub enum LeaseResult {
    /// The caller owns the key and must drive it to a terminal state.
    Acquired { lease_token: Uuid },
    /// Another request got there first; the current record is returned.
    Existing { record: IdempotencyRecord },
}

/// Validates a client-supplied idempotency key: 1-255 printable ASCII
/// characters, no control bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(AppError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > 255 {
        return Err(AppError::InvalidKey(format!(
            "key exceeds maximum length of 255 characters (got {})",
            key.len()
        )));
    }
    if !key.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(AppError::InvalidKey(
            "key contains non-printable or non-ASCII characters".to_string(),
        ));
    }
    Ok(())
}

/// Returns true for a 64-character lowercase hex digest.
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    fingerprint.len() == 64
        && fingerprint
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Serde codec storing binary bodies as standard base64 text.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
