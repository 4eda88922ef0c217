//! Response reconstruction from stored records.

use crate::error::{AppError, Result};
use crate::headers::{add_replay_headers, filter_response_headers, get_header_value};
use crate::models::IdempotencyRecord;

/// The response shape flowing through the middleware: handler output,
/// replayed artifacts, and policy responses all use it. Header names
/// are lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HandlerResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }

    /// Plain-text policy response (409, 413, 422, 425, 500).
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: body.into().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        get_header_value(&self.headers, name)
    }
}

/// Reconstructs the client-facing response from a terminal record:
/// status and body verbatim, volatile headers dropped, replay
/// annotations appended.
pub fn replay_response(
    record: &IdempotencyRecord,
    key: &str,
    strip_set_cookie: bool,
) -> Result<HandlerResponse> {
    let stored = record.response.as_ref().ok_or_else(|| {
        AppError::storage(format!(
            "record for key {} is {:?} but has no stored response",
            record.key, record.state
        ))
    })?;

    let headers = filter_response_headers(&stored.headers, strip_set_cookie);
    let headers = add_replay_headers(headers, key, true);

    Ok(HandlerResponse {
        status: stored.status,
        headers,
        body: stored.body.clone(),
    })
}
