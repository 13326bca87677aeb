//! Client-visible error taxonomy and the error response envelope.
//!
//! Subsystem errors (store, queue, dispatch) convert into an [`ApiError`] at
//! the handler boundary; nothing below the ingress layer speaks HTTP status
//! codes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Stable error codes carried in the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    PreconditionFailed,
    ValidationError,
    RateLimited,
    InternalError,
    UpstreamError,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Error payload inside the envelope.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorMeta {
    #[serde(rename = "requestId")]
    request_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorEnvelope {
    error: ErrorBody,
    meta: ErrorMeta,
}

/// A client-visible failure, rendered as the error envelope.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub request_id: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: request_id.into(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message, request_id)
    }

    pub fn validation(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message, request_id)
    }

    pub fn not_found(message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message, request_id)
    }

    /// Internal failure: log the cause, hide it from the client.
    pub fn internal(error: impl std::fmt::Display, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        tracing::error!(request_id = %request_id, error = %error, "internal error");
        Self::new(ErrorCode::InternalError, "internal error", request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                details: self.details,
            },
            meta: ErrorMeta {
                request_id: self.request_id,
            },
        };
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_statuses() {
        assert_eq!(ErrorCode::BadRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::ValidationError.status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::UpstreamError.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn envelope_serializes_code_as_screaming_snake() {
        let body = ErrorBody {
            code: ErrorCode::ValidationError,
            message: "prompt too long".to_string(),
            details: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert!(json.get("details").is_none());
    }
}
