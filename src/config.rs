use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

const VALID_HTTP_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// Behavior for concurrent admissions that observe a RUNNING record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitPolicy {
    /// Poll until the in-flight request reaches a terminal state.
    Wait,
    /// Return 409 with a Retry-After hint immediately.
    NoWait,
}

impl fmt::Display for WaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPolicy::Wait => write!(f, "wait"),
            WaitPolicy::NoWait => write!(f, "no-wait"),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Configuration for the idempotency layer. Immutable after
/// construction; validation runs once at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// HTTP methods that engage the middleware.
    #[serde(default = "default_enabled_methods", deserialize_with = "string_or_vec")]
    pub enabled_methods: Vec<String>,

    /// Record lifetime when the client does not send `Idempotency-TTL`.
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Lower clamp bound for client-requested TTLs.
    #[serde(default = "default_min_ttl_seconds")]
    pub min_ttl_seconds: u64,

    /// Upper clamp bound for client-requested TTLs.
    #[serde(default = "default_max_ttl_seconds")]
    pub max_ttl_seconds: u64,

    #[serde(default = "default_wait_policy")]
    pub wait_policy: WaitPolicy,

    /// Bounds handler execution and wait-policy polling.
    #[serde(default = "default_execution_timeout_seconds")]
    pub execution_timeout_seconds: u64,

    #[serde(default = "default_wait_poll_interval_ms")]
    pub wait_poll_interval_ms: u64,

    /// Status returned when a polling waiter times out. 425 by default;
    /// 503 is the sanctioned alternative.
    #[serde(default = "default_wait_timeout_status_code")]
    pub wait_timeout_status_code: u16,

    /// Cap for the Retry-After hint on in-progress responses.
    #[serde(default = "default_in_progress_retry_after_seconds")]
    pub in_progress_retry_after_seconds: u64,

    /// Request body cap in bytes; 0 disables the cap.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Header names included in the request fingerprint.
    #[serde(default = "default_fingerprint_headers", deserialize_with = "string_or_vec")]
    pub fingerprint_headers: Vec<String>,

    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    /// Root directory for the `file` backend.
    #[serde(default = "default_file_storage_path")]
    pub file_storage_path: String,

    /// Drop `Set-Cookie` from replayed responses.
    #[serde(default)]
    pub replay_strip_set_cookie: bool,
}

fn default_enabled_methods() -> Vec<String> {
    vec![
        "POST".to_string(),
        "PUT".to_string(),
        "PATCH".to_string(),
        "DELETE".to_string(),
    ]
}

fn default_ttl_seconds() -> u64 {
    86_400
}

fn default_min_ttl_seconds() -> u64 {
    1
}

fn default_max_ttl_seconds() -> u64 {
    604_800
}

fn default_wait_policy() -> WaitPolicy {
    WaitPolicy::Wait
}

fn default_execution_timeout_seconds() -> u64 {
    30
}

fn default_wait_poll_interval_ms() -> u64 {
    100
}

fn default_wait_timeout_status_code() -> u16 {
    425
}

fn default_in_progress_retry_after_seconds() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

fn default_fingerprint_headers() -> Vec<String> {
    vec!["content-type".to_string(), "content-length".to_string()]
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_file_storage_path() -> String {
    "./data/idempotency".to_string()
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled_methods: default_enabled_methods(),
            default_ttl_seconds: default_ttl_seconds(),
            min_ttl_seconds: default_min_ttl_seconds(),
            max_ttl_seconds: default_max_ttl_seconds(),
            wait_policy: default_wait_policy(),
            execution_timeout_seconds: default_execution_timeout_seconds(),
            wait_poll_interval_ms: default_wait_poll_interval_ms(),
            wait_timeout_status_code: default_wait_timeout_status_code(),
            in_progress_retry_after_seconds: default_in_progress_retry_after_seconds(),
            max_body_bytes: default_max_body_bytes(),
            fingerprint_headers: default_fingerprint_headers(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            storage_backend: default_storage_backend(),
            file_storage_path: default_file_storage_path(),
            replay_strip_set_cookie: false,
        }
    }
}

impl IdempotencyConfig {
    /// Loads configuration from an optional `config/idempotency` file
    /// plus `IDEMPOTENCY_`-prefixed environment variables, then
    /// normalizes and validates it.
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/idempotency").required(false))
            .add_source(config::Environment::with_prefix("IDEMPOTENCY").try_parsing(true));

        let loaded: Self = builder
            .build()
            .map_err(|e| AppError::Internal(e.into()))?
            .try_deserialize()
            .map_err(|e| AppError::Internal(e.into()))?;

        loaded.normalized()
    }

    /// Uppercases methods, lowercases fingerprint headers, and checks
    /// every range constraint. Returns the normalized config.
    pub fn normalized(mut self) -> Result<Self> {
        self.enabled_methods = self
            .enabled_methods
            .iter()
            .map(|method| method.trim().to_ascii_uppercase())
            .filter(|method| !method.is_empty())
            .collect();
        self.fingerprint_headers = self
            .fingerprint_headers
            .iter()
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        for method in &self.enabled_methods {
            if !VALID_HTTP_METHODS.contains(&method.as_str()) {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "invalid HTTP method in enabled_methods: {method}"
                )));
            }
        }
        if !(1..=604_800).contains(&self.default_ttl_seconds) {
            return Err(AppError::Internal(anyhow::anyhow!(
                "default_ttl_seconds must be between 1 and 604800, got {}",
                self.default_ttl_seconds
            )));
        }
        if self.min_ttl_seconds == 0 || self.min_ttl_seconds > self.max_ttl_seconds {
            return Err(AppError::Internal(anyhow::anyhow!(
                "ttl clamp bounds are inverted: min {} max {}",
                self.min_ttl_seconds,
                self.max_ttl_seconds
            )));
        }
        if !(1..=300).contains(&self.execution_timeout_seconds) {
            return Err(AppError::Internal(anyhow::anyhow!(
                "execution_timeout_seconds must be between 1 and 300, got {}",
                self.execution_timeout_seconds
            )));
        }
        if self.wait_poll_interval_ms == 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "wait_poll_interval_ms must be positive"
            )));
        }
        if !(100..=599).contains(&self.wait_timeout_status_code) {
            return Err(AppError::Internal(anyhow::anyhow!(
                "wait_timeout_status_code must be a valid HTTP status, got {}",
                self.wait_timeout_status_code
            )));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "cleanup_interval_seconds must be positive"
            )));
        }
        Ok(())
    }

    /// Returns true if the method engages the middleware.
    pub fn method_enabled(&self, method: &str) -> bool {
        let upper = method.to_ascii_uppercase();
        self.enabled_methods.iter().any(|m| *m == upper)
    }

    /// Resolves the effective TTL for a request, clamping any
    /// client-requested value into `[min_ttl_seconds, max_ttl_seconds]`.
    pub fn effective_ttl_seconds(&self, requested: Option<u64>) -> u64 {
        match requested {
            Some(ttl) => ttl.clamp(self.min_ttl_seconds, self.max_ttl_seconds),
            None => self.default_ttl_seconds,
        }
    }
}

/// Accepts either a list or a comma-separated string, so values work
/// both from config files and from environment variables.
fn string_or_vec<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(joined) => Ok(joined
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

/// Settings for the demo service binary.
#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        builder
            .build()
            .map_err(|e| AppError::Internal(e.into()))?
            .try_deserialize()
            .map_err(|e| AppError::Internal(e.into()))
    }
}
