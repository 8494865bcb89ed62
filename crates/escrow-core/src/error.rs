//! # Error Hierarchy
//!
//! Structured error types for foundational primitives, built with `thiserror`.
//! Each variant carries the rejected input so that operators can diagnose
//! malformed requests without guesswork.

use thiserror::Error;

/// Errors during canonical serialization.
#[derive(Error, Debug)]
pub enum CanonicalizationError {
    /// Float values are not permitted in canonical representations.
    /// Amounts must be integers in minor units.
    #[error("float values are not permitted in canonical representations; use integer minor units for amounts: {0}")]
    FloatRejected(f64),

    /// JSON serialization failed during canonicalization.
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Validation errors for domain primitive newtypes.
///
/// Each primitive enforces its format at construction time, so a value that
/// exists is a value that passed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Actor identifier is empty, too long, or contains whitespace.
    #[error("invalid actor id: \"{0}\" (expected 1-128 characters without whitespace)")]
    InvalidActorId(String),

    /// Currency code is not a three-letter uppercase ISO 4217 code.
    #[error("invalid currency code: \"{0}\" (expected 3 uppercase ASCII letters, e.g. USD)")]
    InvalidCurrency(String),

    /// Amount must be strictly positive.
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(i64),

    /// Arithmetic on minor units overflowed.
    #[error("amount arithmetic overflow: {0}")]
    AmountOverflow(String),

    /// A required text field is empty or too long.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        /// The field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Timestamp string is not valid RFC 3339.
    #[error("invalid timestamp: \"{value}\" ({reason})")]
    InvalidTimestamp {
        /// The string that failed to parse.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl ValidationError {
    /// Shorthand for an [`InvalidField`](ValidationError::InvalidField) error.
    pub fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Validate a free-text field: trimmed, non-empty, at most `max` characters.
///
/// Returns the trimmed value.
pub fn validate_text(
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::field(field, "must not be empty"));
    }
    if trimmed.chars().count() > max {
        return Err(ValidationError::field(
            field,
            format!("must not exceed {max} characters"),
        ));
    }
    Ok(trimmed.to_string())
}
