//! # Workflow Error Types
//!
//! Every command returns either success or exactly one [`EscrowError`]. The
//! variants form a closed taxonomy so callers can map them to transport
//! status codes without string matching:
//!
//! | Variant               | Meaning                                           |
//! |-----------------------|---------------------------------------------------|
//! | `Validation`          | malformed input; nothing was attempted            |
//! | `Authorization`       | actor lacks the role the command requires         |
//! | `StateConflict`       | command is illegal in the current state           |
//! | `InsufficientFunds`   | amount exceeds the remaining balance              |
//! | `InvariantViolation`  | ledger identity broken; fatal, operator alert     |
//! | `*NotFound`           | unknown escrow, request or condition              |
//!
//! A failed command never leaves a partial write behind.

use thiserror::Error;

use escrow_core::{
    ActorId, CanonicalizationError, ConditionId, EscrowId, FundRequestId, MinorUnits,
    ValidationError,
};

use crate::escrow::EscrowState;
use crate::lifecycle::RequestState;
use crate::review::Decision;

/// A command that is well-formed but illegal in the current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateConflict {
    /// The escrow already has a fund request in CREATED or UNDER_REVIEW.
    #[error("escrow {escrow_id} already has active fund request {request_id}")]
    RequestInProgress {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// The request that is still active.
        request_id: FundRequestId,
    },

    /// The fund request is in a terminal state.
    #[error("fund request {request_id} is already finalized as {state}")]
    RequestFinalized {
        /// The request identifier.
        request_id: FundRequestId,
        /// The terminal state.
        state: RequestState,
    },

    /// The reviewer has already recorded a decision.
    #[error("reviewer {user_id} already decided {decision} on fund request {request_id}")]
    AlreadyReviewed {
        /// The request identifier.
        request_id: FundRequestId,
        /// The reviewer.
        user_id: ActorId,
        /// The decision already on record.
        decision: Decision,
    },

    /// The actor is not in the reviewer roster snapshotted for the request.
    #[error("{user_id} is not a reviewer of fund request {request_id}")]
    NotAReviewer {
        /// The request identifier.
        request_id: FundRequestId,
        /// The actor who attempted to review.
        user_id: ActorId,
    },

    /// The escrow is closed and accepts no further commands.
    #[error("escrow {escrow_id} is closed")]
    EscrowClosed {
        /// The escrow identifier.
        escrow_id: EscrowId,
    },

    /// The escrow state does not permit the operation.
    #[error("escrow {escrow_id} cannot perform {operation} in state {state}")]
    InvalidEscrowState {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// The attempted operation.
        operation: &'static str,
        /// The current escrow state.
        state: EscrowState,
    },

    /// The caller's expected version does not match the stored version.
    #[error("escrow {escrow_id} is at version {actual}, expected {expected}")]
    VersionMismatch {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// Version the caller last observed.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },
}

impl StateConflict {
    /// Stable machine-readable code for the conflict.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestInProgress { .. } => "REQUEST_IN_PROGRESS",
            Self::RequestFinalized { .. } => "REQUEST_FINALIZED",
            Self::AlreadyReviewed { .. } => "ALREADY_REVIEWED",
            Self::NotAReviewer { .. } => "NOT_A_REVIEWER",
            Self::EscrowClosed { .. } => "ESCROW_CLOSED",
            Self::InvalidEscrowState { .. } => "INVALID_ESCROW_STATE",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
        }
    }
}

/// Errors returned by escrow workflow commands and queries.
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Malformed input.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The actor lacks the required role.
    #[error("{actor} is not authorized to {operation} on escrow {escrow_id}: requires {required}")]
    Authorization {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// The rejected actor.
        actor: ActorId,
        /// The attempted operation.
        operation: &'static str,
        /// The role the operation requires.
        required: &'static str,
    },

    /// The command is illegal in the current state.
    #[error("state conflict: {0}")]
    StateConflict(#[from] StateConflict),

    /// The requested amount exceeds the remaining balance.
    #[error("requested {requested} exceeds remaining balance {remaining} of escrow {escrow_id}")]
    InsufficientFunds {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// The requested amount.
        requested: MinorUnits,
        /// The remaining balance.
        remaining: MinorUnits,
    },

    /// The ledger identity or an internal consistency check failed.
    ///
    /// Fatal: the command is aborted and operators are alerted.
    #[error("invariant violation on escrow {escrow_id}: {detail}")]
    InvariantViolation {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// What was found broken.
        detail: String,
    },

    /// No escrow with this identifier.
    #[error("escrow {0} not found")]
    EscrowNotFound(EscrowId),

    /// No fund request with this identifier in the escrow.
    #[error("fund request {request_id} not found in escrow {escrow_id}")]
    RequestNotFound {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// The missing request.
        request_id: FundRequestId,
    },

    /// No condition with this identifier in the escrow.
    #[error("condition {condition_id} not found in escrow {escrow_id}")]
    ConditionNotFound {
        /// The escrow identifier.
        escrow_id: EscrowId,
        /// The missing condition.
        condition_id: ConditionId,
    },

    /// Snapshot or audit payload could not be canonicalized.
    #[error("canonicalization error: {0}")]
    Canonicalization(#[from] CanonicalizationError),
}

impl EscrowError {
    /// Stable category code for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Authorization { .. } => "AUTHORIZATION_ERROR",
            Self::StateConflict(_) => "STATE_CONFLICT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::EscrowNotFound(_)
            | Self::RequestNotFound { .. }
            | Self::ConditionNotFound { .. } => "NOT_FOUND",
            Self::Canonicalization(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error indicates corrupted state rather than a rejected
    /// command.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }

    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation(ValidationError::field(field, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_funds_display() {
        let id = EscrowId::new();
        let err = EscrowError::InsufficientFunds {
            escrow_id: id,
            requested: MinorUnits::new(200),
            remaining: MinorUnits::new(150),
        };
        let msg = format!("{err}");
        assert!(msg.contains("200"));
        assert!(msg.contains("150"));
        assert!(msg.contains(&id.to_string()));
        assert_eq!(err.kind(), "INSUFFICIENT_FUNDS");
    }

    #[test]
    fn authorization_display() {
        let err = EscrowError::Authorization {
            escrow_id: EscrowId::new(),
            actor: ActorId::new("mallory").unwrap(),
            operation: "fund",
            required: "custodian",
        };
        let msg = format!("{err}");
        assert!(msg.contains("mallory"));
        assert!(msg.contains("fund"));
        assert!(msg.contains("custodian"));
    }

    #[test]
    fn state_conflict_converts_and_keeps_code() {
        let conflict = StateConflict::RequestFinalized {
            request_id: FundRequestId::new(),
            state: RequestState::Rejected,
        };
        assert_eq!(conflict.code(), "REQUEST_FINALIZED");
        let err: EscrowError = conflict.into();
        assert_eq!(err.kind(), "STATE_CONFLICT");
        assert!(format!("{err}").contains("REJECTED"));
    }

    #[test]
    fn version_mismatch_display() {
        let err = StateConflict::VersionMismatch {
            escrow_id: EscrowId::new(),
            expected: 3,
            actual: 5,
        };
        let msg = format!("{err}");
        assert!(msg.contains("version 5"));
        assert!(msg.contains("expected 3"));
    }

    #[test]
    fn only_invariant_violation_is_fatal() {
        let fatal = EscrowError::InvariantViolation {
            escrow_id: EscrowId::new(),
            detail: "total != released + remaining".to_string(),
        };
        assert!(fatal.is_fatal());
        assert!(!EscrowError::EscrowNotFound(EscrowId::new()).is_fatal());
        assert!(!EscrowError::Validation(ValidationError::NonPositiveAmount(0)).is_fatal());
    }

    #[test]
    fn not_found_variants_share_kind() {
        let escrow_id = EscrowId::new();
        assert_eq!(EscrowError::EscrowNotFound(escrow_id).kind(), "NOT_FOUND");
        assert_eq!(
            EscrowError::RequestNotFound {
                escrow_id,
                request_id: FundRequestId::new()
            }
            .kind(),
            "NOT_FOUND"
        );
        assert_eq!(
            EscrowError::ConditionNotFound {
                escrow_id,
                condition_id: ConditionId::new()
            }
            .kind(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn validation_converts_from_core() {
        let err: EscrowError = ValidationError::InvalidCurrency("usd".into()).into();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
        assert!(format!("{err}").contains("usd"));
    }
}
