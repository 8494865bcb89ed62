//! # Escrow Ledger
//!
//! Owns the three amounts of an escrow and the identity that binds them:
//!
//! ```text
//! total_amount = released_amount + remaining_amount
//! ```
//!
//! The identity is verified before and after every mutation. A violation is
//! never repaired in place; it surfaces as
//! [`EscrowError::InvariantViolation`] and the command is aborted.

use serde::{Deserialize, Serialize};

use escrow_core::{CurrencyCode, EscrowId, MinorUnits};

use crate::error::EscrowError;

/// Funded, released and remaining amounts of one escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowLedger {
    currency: CurrencyCode,
    total_amount: MinorUnits,
    released_amount: MinorUnits,
    remaining_amount: MinorUnits,
}

impl EscrowLedger {
    /// A ledger with nothing deposited yet.
    pub fn unfunded(currency: CurrencyCode) -> Self {
        Self {
            currency,
            total_amount: MinorUnits::ZERO,
            released_amount: MinorUnits::ZERO,
            remaining_amount: MinorUnits::ZERO,
        }
    }

    /// Open a funded ledger with `released = 0` and `remaining = total`.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] if the total is not positive or the
    /// currency is not a valid ISO 4217 code.
    pub fn open(total_amount: i64, currency: &str) -> Result<Self, EscrowError> {
        let total = MinorUnits::positive(total_amount)?;
        let currency = CurrencyCode::new(currency)?;
        Ok(Self {
            currency,
            total_amount: total,
            released_amount: MinorUnits::ZERO,
            remaining_amount: total,
        })
    }

    /// The ledger currency.
    pub fn currency(&self) -> &CurrencyCode {
        &self.currency
    }

    /// Total amount deposited.
    pub fn total_amount(&self) -> MinorUnits {
        self.total_amount
    }

    /// Sum of all approved releases.
    pub fn released_amount(&self) -> MinorUnits {
        self.released_amount
    }

    /// Amount still held.
    pub fn remaining_amount(&self) -> MinorUnits {
        self.remaining_amount
    }

    /// Whether every deposited unit has been released.
    pub fn is_exhausted(&self) -> bool {
        !self.total_amount.is_zero() && self.remaining_amount.is_zero()
    }

    /// Check that `amount` can be reserved against the remaining balance.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] for a non-positive amount and
    /// [`EscrowError::InsufficientFunds`] if it exceeds the remaining balance.
    pub fn check_available(&self, escrow_id: EscrowId, amount: i64) -> Result<MinorUnits, EscrowError> {
        let amount = MinorUnits::positive(amount)?;
        if amount > self.remaining_amount {
            return Err(EscrowError::InsufficientFunds {
                escrow_id,
                requested: amount,
                remaining: self.remaining_amount,
            });
        }
        Ok(amount)
    }

    /// Move `amount` from remaining to released.
    ///
    /// The identity is verified on the current values, the new values are
    /// computed with checked arithmetic, verified again, and only then
    /// written back. On any error the ledger is unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InsufficientFunds`] if `amount` exceeds the
    /// remaining balance and [`EscrowError::InvariantViolation`] if the
    /// identity fails before or after the release.
    pub fn apply_release(&mut self, escrow_id: EscrowId, amount: MinorUnits) -> Result<(), EscrowError> {
        self.verify(escrow_id)?;
        let amount = self.check_available(escrow_id, amount.value())?;

        let overflow = |detail: String| EscrowError::InvariantViolation { escrow_id, detail };
        let next = Self {
            currency: self.currency.clone(),
            total_amount: self.total_amount,
            released_amount: self
                .released_amount
                .checked_add(amount)
                .map_err(|e| overflow(e.to_string()))?,
            remaining_amount: self
                .remaining_amount
                .checked_sub(amount)
                .map_err(|e| overflow(e.to_string()))?,
        };
        next.verify(escrow_id)?;
        *self = next;
        Ok(())
    }

    /// Verify `total = released + remaining` with no negative component.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvariantViolation`] describing the broken
    /// values.
    pub fn verify(&self, escrow_id: EscrowId) -> Result<(), EscrowError> {
        let broken = |detail: String| Err(EscrowError::InvariantViolation { escrow_id, detail });

        if self.total_amount.is_negative()
            || self.released_amount.is_negative()
            || self.remaining_amount.is_negative()
        {
            return broken(format!(
                "negative ledger component: total={} released={} remaining={}",
                self.total_amount, self.released_amount, self.remaining_amount
            ));
        }
        match self.released_amount.checked_add(self.remaining_amount) {
            Ok(sum) if sum == self.total_amount => Ok(()),
            Ok(sum) => broken(format!(
                "total {} != released {} + remaining {} (= {sum})",
                self.total_amount, self.released_amount, self.remaining_amount
            )),
            Err(e) => broken(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(total: i64) -> EscrowLedger {
        EscrowLedger::open(total, "USD").unwrap()
    }

    #[test]
    fn open_sets_remaining_to_total() {
        let l = open(100_000);
        assert_eq!(l.total_amount(), MinorUnits::new(100_000));
        assert_eq!(l.released_amount(), MinorUnits::ZERO);
        assert_eq!(l.remaining_amount(), MinorUnits::new(100_000));
        assert_eq!(l.currency().as_str(), "USD");
        assert!(l.verify(EscrowId::new()).is_ok());
    }

    #[test]
    fn open_rejects_non_positive_total_and_bad_currency() {
        assert!(matches!(
            EscrowLedger::open(0, "USD"),
            Err(EscrowError::Validation(_))
        ));
        assert!(matches!(
            EscrowLedger::open(-10, "USD"),
            Err(EscrowError::Validation(_))
        ));
        assert!(matches!(
            EscrowLedger::open(10, "dollars"),
            Err(EscrowError::Validation(_))
        ));
    }

    #[test]
    fn unfunded_ledger_is_consistent_and_not_exhausted() {
        let l = EscrowLedger::unfunded(CurrencyCode::new("EUR").unwrap());
        assert!(l.verify(EscrowId::new()).is_ok());
        assert!(!l.is_exhausted());
    }

    #[test]
    fn release_moves_amount_to_released() {
        let id = EscrowId::new();
        let mut l = open(100_000);
        l.apply_release(id, MinorUnits::new(40_000)).unwrap();
        assert_eq!(l.released_amount(), MinorUnits::new(40_000));
        assert_eq!(l.remaining_amount(), MinorUnits::new(60_000));
        assert!(!l.is_exhausted());
    }

    #[test]
    fn release_of_full_balance_exhausts() {
        let id = EscrowId::new();
        let mut l = open(500);
        l.apply_release(id, MinorUnits::new(500)).unwrap();
        assert!(l.is_exhausted());
    }

    #[test]
    fn release_exceeding_remaining_is_rejected_without_change() {
        let id = EscrowId::new();
        let mut l = open(150);
        let before = l.clone();
        let err = l.apply_release(id, MinorUnits::new(200)).unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientFunds { .. }));
        assert_eq!(l, before);
    }

    #[test]
    fn check_available_rejects_zero() {
        let l = open(150);
        assert!(matches!(
            l.check_available(EscrowId::new(), 0),
            Err(EscrowError::Validation(_))
        ));
        assert_eq!(
            l.check_available(EscrowId::new(), 150).unwrap(),
            MinorUnits::new(150)
        );
    }

    #[test]
    fn broken_identity_is_detected_and_release_refused() {
        let mut l: EscrowLedger = serde_json::from_value(serde_json::json!({
            "currency": "USD",
            "total_amount": 100,
            "released_amount": 10,
            "remaining_amount": 80
        }))
        .unwrap();
        let id = EscrowId::new();
        let err = l.verify(id).unwrap_err();
        assert!(err.is_fatal());
        assert!(format!("{err}").contains("total 100"));

        let before = l.clone();
        assert!(l.apply_release(id, MinorUnits::new(5)).unwrap_err().is_fatal());
        assert_eq!(l, before);
    }

    #[test]
    fn negative_component_is_detected() {
        let l: EscrowLedger = serde_json::from_value(serde_json::json!({
            "currency": "USD",
            "total_amount": 100,
            "released_amount": 110,
            "remaining_amount": -10
        }))
        .unwrap();
        assert!(l.verify(EscrowId::new()).unwrap_err().is_fatal());
    }
}
