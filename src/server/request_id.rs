//! Mandatory `X-Request-Id` correlation.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;

/// Request correlation ID, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Reject any request without an `X-Request-Id` header before it reaches a
/// handler.
pub async fn require_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    match request_id {
        Some(id) => {
            request.extensions_mut().insert(RequestId(id));
            next.run(request).await
        }
        None => ApiError::bad_request("missing X-Request-Id header", "unknown").into_response(),
    }
}
