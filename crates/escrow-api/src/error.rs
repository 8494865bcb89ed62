//! # API Error Types
//!
//! Structured error type implementing `axum::response::IntoResponse`.
//! Maps [`EscrowError`] to HTTP status codes and JSON error bodies with a
//! machine-readable code, a message and optional details. Invariant
//! violations are logged and returned as an opaque 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use escrow_workflow::EscrowError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Structured JSON error response body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Inner error detail.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "NOT_FOUND", "STATE_CONFLICT").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details, present only for some client errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Application-level error type that implements [`IntoResponse`] for Axum.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Request validation failed (422).
    #[error("validation error: {0}")]
    Validation(String),

    /// Request body or header could not be parsed (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials or actor identity (401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The actor may not perform the operation (403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Conflict with current escrow state (409).
    #[error("conflict: {message}")]
    Conflict {
        code: &'static str,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Internal server error (500). Message is logged but not returned to client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Return the HTTP status code and machine-readable error code for this error.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "AUTHORIZATION_ERROR"),
            Self::Conflict { code, .. } => (StatusCode::CONFLICT, code),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Never expose internal error messages to clients.
        let message = match &self {
            Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        if matches!(&self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal server error");
        }

        let details = match self {
            Self::Conflict { details, .. } => details,
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<escrow_core::ValidationError> for AppError {
    fn from(err: escrow_core::ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<EscrowError> for AppError {
    fn from(err: EscrowError) -> Self {
        match &err {
            EscrowError::Validation(_) => Self::Validation(err.to_string()),
            EscrowError::Authorization { .. } => Self::Forbidden(err.to_string()),
            EscrowError::StateConflict(conflict) => Self::Conflict {
                code: "STATE_CONFLICT",
                details: Some(serde_json::json!({ "reason": conflict.code() })),
                message: err.to_string(),
            },
            EscrowError::InsufficientFunds {
                requested,
                remaining,
                ..
            } => Self::Conflict {
                code: "INSUFFICIENT_FUNDS",
                details: Some(serde_json::json!({
                    "requested": requested.value(),
                    "remaining": remaining.value(),
                })),
                message: err.to_string(),
            },
            EscrowError::EscrowNotFound(_)
            | EscrowError::RequestNotFound { .. }
            | EscrowError::ConditionNotFound { .. } => Self::NotFound(err.to_string()),
            EscrowError::InvariantViolation { .. } | EscrowError::Canonicalization(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}
