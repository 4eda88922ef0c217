use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Error taxonomy for the idempotency layer.
///
/// Policy outcomes that have a well-defined response (no-wait 409,
/// waiter timeout, replay) flow through the response path instead;
/// only genuine faults and admission rejections live here.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("request body exceeds maximum of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("idempotency key `{key}` reused with a different request fingerprint")]
    Conflict {
        key: String,
        stored_fingerprint: String,
        request_fingerprint: String,
    },

    #[error("storage backend failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status code this error surfaces as.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidKey(_) => 422,
            AppError::PayloadTooLarge { .. } => 413,
            AppError::Conflict { .. } => 409,
            AppError::Storage(_) | AppError::Internal(_) => 500,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
