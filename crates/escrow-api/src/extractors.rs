//! # Custom Extractors & Validation
//!
//! Provides the [`Validate`] trait for request DTOs, a helper to extract
//! and validate JSON bodies in handlers, and the [`ExpectedVersion`]
//! extractor for optimistic concurrency.

use axum::extract::rejection::JsonRejection;
use axum::http::header;
use axum::http::request::Parts;
use axum::Json;

use crate::error::AppError;

/// Trait for request types that can validate their business rules
/// beyond what serde deserialization checks.
pub trait Validate {
    /// Validate business rules. Returns an error message on failure.
    fn validate(&self) -> Result<(), String>;
}

/// Extract a JSON body, mapping deserialization errors to [`AppError::BadRequest`].
pub fn extract_json<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    result
        .map(|Json(v)| v)
        .map_err(|err| AppError::BadRequest(err.body_text()))
}

/// Extract a JSON body and validate it using the [`Validate`] trait.
pub fn extract_validated_json<T: Validate>(
    result: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    let value = extract_json(result)?;
    value.validate().map_err(AppError::Validation)?;
    Ok(value)
}

/// Escrow version the caller expects, read from `If-Match`.
///
/// Absent header means "any version". The value may be quoted like an
/// entity tag (`"3"`) or bare (`3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpectedVersion(pub Option<u64>);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for ExpectedVersion {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(raw) = parts.headers.get(header::IF_MATCH) else {
            return Ok(Self(None));
        };
        raw.to_str()
            .ok()
            .map(|s| s.trim().trim_start_matches("W/").trim_matches('"'))
            .and_then(|s| s.parse::<u64>().ok())
            .map(|v| Self(Some(v)))
            .ok_or_else(|| AppError::BadRequest("If-Match must carry an escrow version number".into()))
    }
}
