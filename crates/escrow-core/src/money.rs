//! # Money Primitives
//!
//! Amounts are signed 64-bit counts of the smallest currency unit (cents,
//! paise, fils). Signed rather than unsigned so that a broken ledger identity
//! is representable and detectable instead of wrapping silently.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// An amount in minor currency units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MinorUnits(i64);

impl MinorUnits {
    /// The zero amount.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw minor-unit count.
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Wrap a raw count, rejecting zero and negative values.
    pub fn positive(value: i64) -> Result<Self, ValidationError> {
        if value <= 0 {
            return Err(ValidationError::NonPositiveAmount(value));
        }
        Ok(Self(value))
    }

    /// The raw minor-unit count.
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Whether the amount is exactly zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether the amount is negative.
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Checked addition.
    pub fn checked_add(self, rhs: Self) -> Result<Self, ValidationError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or_else(|| ValidationError::AmountOverflow(format!("{} + {}", self.0, rhs.0)))
    }

    /// Checked subtraction.
    pub fn checked_sub(self, rhs: Self) -> Result<Self, ValidationError> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or_else(|| ValidationError::AmountOverflow(format!("{} - {}", self.0, rhs.0)))
    }
}

impl std::fmt::Display for MinorUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ISO 4217 currency code.
///
/// Only the shape is validated (three uppercase ASCII letters); the list of
/// active codes is a presentation concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Create a validated currency code.
    pub fn new(code: impl Into<String>) -> Result<Self, ValidationError> {
        let code = code.into();
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ValidationError::InvalidCurrency(code));
        }
        Ok(Self(code))
    }

    /// Access the code string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

impl std::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
