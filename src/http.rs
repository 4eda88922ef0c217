//! Axum integration: mounts the idempotency core as request middleware.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/api/payments", post(create_payment))
//!     .layer(axum::middleware::from_fn_with_state(
//!         middleware.clone(),
//!         http::idempotency_middleware,
//!     ));
//! ```

use crate::error::{AppError, Result};
use crate::middleware::{HttpRequest, IdempotencyMiddleware, IDEMPOTENCY_KEY_HEADER};
use crate::replay::HandlerResponse;
use anyhow::anyhow;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

/// Axum middleware function wiring requests through the idempotency
/// core. Engaged requests are buffered in full so the core can apply
/// its admission rules in order (key validation precedes the body-size
/// cap), then the body is handed to the downstream handler unchanged.
pub async fn idempotency_middleware(
    State(layer): State<Arc<IdempotencyMiddleware>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    // Pass-through traffic is never buffered.
    let engaged = layer.config().method_enabled(parts.method.as_str())
        && parts.headers.contains_key(IDEMPOTENCY_KEY_HEADER);
    if !engaged {
        return next.run(Request::from_parts(parts, body)).await;
    }

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(error = %e, "failed to buffer request body");
            return plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read request body".to_string(),
            );
        }
    };

    let normalized = HttpRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query_string: parts.uri.query().unwrap_or("").to_string(),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: bytes.to_vec(),
    };

    // Rebuffer: the downstream handler sees the original body once.
    let downstream = Request::from_parts(parts, Body::from(bytes));
    let handler = move || async move {
        let response = next.run(downstream).await;
        capture_response(response).await
    };

    into_axum_response(layer.process(&normalized, handler).await)
}

/// Collects a downstream response into the middleware's shape so it
/// can be stored and replayed.
async fn capture_response(response: Response) -> Result<HandlerResponse> {
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::Internal(anyhow!("collect handler response body: {e}")))?;

    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();

    Ok(HandlerResponse::new(
        parts.status.as_u16(),
        headers,
        bytes.to_vec(),
    ))
}

/// Converts the middleware response back to an Axum response. Header
/// pairs that fail HTTP validation are dropped rather than failing the
/// whole response.
fn into_axum_response(response: HandlerResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, value) in response.headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                out.headers_mut().append(name, value);
            }
            _ => {
                tracing::debug!(header = %name, "dropping invalid header on conversion");
            }
        }
    }
    out
}

fn plain_response(status: StatusCode, body: String) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_static("text/plain"),
    );
    response
}
