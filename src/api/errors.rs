//! API Error Handling
//!
//! Structured error responses with HTTP status codes and request tracking.
//! Scheduler errors map onto statuses by category.

use crate::errors::{ErrorCategory, HouseError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code (NOT_FOUND, BAD_REQUEST, INTEGRITY_VIOLATION, etc.)
    pub code: String,
    pub message: String,
    /// Optional additional details (can be any JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error types with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    InsufficientBalance(String),
    Conflict(String),
    /// Refused action; details carry the unchanged server state
    IntegrityViolation {
        message: String,
        details: Option<serde_json::Value>,
    },
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn service_unavailable(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::ServiceUnavailable(message),
            request_id,
        }
    }

    /// Map a scheduler error by its category
    pub fn from_house(request_id: String, err: HouseError) -> Self {
        let message = err.to_string();
        let kind = match (&err, err.category()) {
            (HouseError::Integrity(violation), _) => ApiErrorKind::IntegrityViolation {
                message,
                details: Some(serde_json::json!({
                    "kind": violation.kind.to_string(),
                    "session_id": violation.session_id,
                    "current": violation.current,
                })),
            },
            (HouseError::InsufficientBalance { .. }, _) => ApiErrorKind::InsufficientBalance(message),
            (_, ErrorCategory::Validation) => ApiErrorKind::BadRequest(message),
            (_, ErrorCategory::Capacity) | (_, ErrorCategory::Conflict) => ApiErrorKind::Conflict(message),
            (_, ErrorCategory::Integrity) => ApiErrorKind::IntegrityViolation { message, details: None },
            (_, ErrorCategory::Infrastructure) => ApiErrorKind::ServiceUnavailable(message),
            (_, ErrorCategory::NotFound) => ApiErrorKind::NotFound(message),
        };
        Self { kind, request_id }
    }

    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiErrorKind::InsufficientBalance(msg) => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_BALANCE", msg)
            }
            ApiErrorKind::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiErrorKind::IntegrityViolation { message, .. } => {
                (StatusCode::FORBIDDEN, "INTEGRITY_VIOLATION", message)
            }
            ApiErrorKind::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
            }
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, code, message) = self.parts();
        write!(f, "[{}] {}: {}", self.request_id, code, message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let message = message.to_string();
        let details = match self.kind {
            ApiErrorKind::IntegrityViolation { details, .. } => details,
            _ => None,
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}
