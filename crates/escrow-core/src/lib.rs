#![deny(missing_docs)]

//! # escrow-core: Foundational Types for the Escrow Release Service
//!
//! Every other crate in the workspace depends on this one. It has no internal
//! crate dependencies, only `serde`, `serde_json`, `thiserror`, `chrono`,
//! `uuid`, and `sha2`.
//!
//! ## Design Principles
//!
//! 1. **Newtype identifiers.** You cannot pass a [`ConditionId`] where an
//!    [`EscrowId`] is expected, and an [`ActorId`] is validated on construction.
//!
//! 2. **Integer money.** Amounts are [`MinorUnits`] (signed 64-bit counts of the
//!    smallest currency unit). There is no floating point anywhere in the
//!    ledger, so the identity `total = released + remaining` is exactly
//!    checkable.
//!
//! 3. **[`CanonicalBytes`] is the sole path to digest computation.** Snapshot
//!    references in the audit trail are [`ContentDigest`]s over canonical JSON.

pub mod canonical;
pub mod digest;
pub mod error;
pub mod identity;
pub mod money;
pub mod temporal;

pub use canonical::CanonicalBytes;
pub use digest::{sha256_digest, ContentDigest};
pub use error::{CanonicalizationError, ValidationError};
pub use identity::{ActorId, ConditionId, DocumentRef, EscrowId, FundRequestId};
pub use money::{CurrencyCode, MinorUnits};
pub use temporal::Timestamp;
