//! # Fund Request Lifecycle
//!
//! State machine for a request to release funds:
//!
//! ```text
//! CREATED ──first review──▶ UNDER_REVIEW ──▶ APPROVED   (terminal)
//!    │                          │        └──▶ REJECTED   (terminal)
//!    └──────────cancel──────────┴───────────▶ CANCELLED  (terminal)
//! ```
//!
//! Terminal requests never change again. [`finalize`] is idempotent: a
//! second call with the same outcome returns the recorded state and writes
//! nothing, so the ledger is debited at most once per request.
//!
//! Expiry is a cancellation performed by the system actor with cause
//! [`CancellationCause::Expired`].

use chrono::Duration;
use serde::{Deserialize, Serialize};

use escrow_core::error::validate_text;
use escrow_core::{ActorId, DocumentRef, EscrowId, FundRequestId, MinorUnits, Timestamp};

use crate::audit::{AuditKind, Recorder};
use crate::error::{EscrowError, StateConflict};
use crate::escrow::{Escrow, EscrowState};
use crate::review::{Review, ReviewCoordinator, ReviewerRoster};

const MAX_REASON_LEN: usize = 200;
const MAX_DESCRIPTION_LEN: usize = 2_000;
const MAX_DOCUMENT_REFS: usize = 20;

/// Fund request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    /// Raised; no reviews yet.
    Created,
    /// At least one review recorded; no decision.
    UnderReview,
    /// Every reviewer approved and required conditions were met. Terminal.
    Approved,
    /// At least one reviewer rejected. Terminal.
    Rejected,
    /// Withdrawn by the custodian, or expired. Terminal.
    Cancelled,
}

impl RequestState {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::UnderReview => "UNDER_REVIEW",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the request can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }

    /// Whether the request blocks new requests on its escrow.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// States reachable in one step.
    pub fn valid_transitions(&self) -> &'static [RequestState] {
        match self {
            Self::Created => &[Self::UnderReview, Self::Cancelled],
            Self::UnderReview => &[Self::Approved, Self::Rejected, Self::Cancelled],
            Self::Approved | Self::Rejected | Self::Cancelled => &[],
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancellationCause {
    /// Withdrawn by the custodian.
    Withdrawn,
    /// Outlived the configured request time-to-live.
    Expired,
}

impl CancellationCause {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Withdrawn => "WITHDRAWN",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for CancellationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    /// Why the request was cancelled.
    pub cause: CancellationCause,
    /// Who cancelled it (the system actor for expiry).
    pub cancelled_by: ActorId,
    /// Free-text reason, if given.
    pub reason: Option<String>,
}

/// Decision to apply in [`finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Approve and release.
    Approve,
    /// Reject.
    Reject,
}

impl Outcome {
    fn target(self) -> RequestState {
        match self {
            Self::Approve => RequestState::Approved,
            Self::Reject => RequestState::Rejected,
        }
    }
}

/// Input for creating a fund request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFundRequest {
    /// Amount in minor units.
    pub amount: i64,
    /// Short reason for the release.
    pub reason: String,
    /// Longer description (may be empty).
    pub description: String,
    /// Supporting documents.
    pub document_refs: Vec<DocumentRef>,
}

/// A request to release part of an escrow's remaining balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundRequest {
    /// Request identifier.
    pub id: FundRequestId,
    /// Amount to release.
    pub amount: MinorUnits,
    /// Short reason.
    pub reason: String,
    /// Longer description.
    pub description: String,
    /// Supporting documents.
    pub document_refs: Vec<DocumentRef>,
    /// Who raised the request.
    pub requested_by: ActorId,
    /// When the request was raised.
    pub requested_at: Timestamp,
    pub(crate) roster: ReviewerRoster,
    pub(crate) reviews: Vec<Review>,
    pub(crate) state: RequestState,
    /// When the request reached a terminal state.
    pub decided_at: Option<Timestamp>,
    /// Set when the request was cancelled.
    pub cancellation: Option<Cancellation>,
}

impl FundRequest {
    /// Current state.
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Reviewers frozen at creation.
    pub fn roster(&self) -> &ReviewerRoster {
        &self.roster
    }

    /// One review per roster member, in roster order.
    pub fn reviews(&self) -> &[Review] {
        &self.reviews
    }

    /// The review slot of a reviewer.
    pub fn review_of(&self, user_id: &ActorId) -> Option<&Review> {
        self.reviews.iter().find(|r| r.user_id == *user_id)
    }

    pub(crate) fn review_of_mut(&mut self, user_id: &ActorId) -> Option<&mut Review> {
        self.reviews.iter_mut().find(|r| r.user_id == *user_id)
    }

    /// Move to `to`, enforcing the state machine.
    pub(crate) fn transition(&mut self, escrow_id: EscrowId, to: RequestState, now: Timestamp) -> Result<(), EscrowError> {
        if self.state.is_terminal() {
            return Err(StateConflict::RequestFinalized {
                request_id: self.id,
                state: self.state,
            }
            .into());
        }
        if !self.state.valid_transitions().contains(&to) {
            return Err(EscrowError::InvariantViolation {
                escrow_id,
                detail: format!("illegal fund request transition {} -> {to}", self.state),
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.decided_at = Some(now);
        }
        Ok(())
    }
}

/// Raise a fund request against a funded escrow.
///
/// Snapshots the reviewer roster and reserves nothing; the amount is
/// checked against the remaining balance now and debited only on approval.
///
/// # Errors
///
/// - [`EscrowError::Validation`] for a non-positive amount or bad text.
/// - [`EscrowError::Authorization`] unless the actor is the custodian or a
///   stakeholder.
/// - [`StateConflict::EscrowClosed`] / [`StateConflict::InvalidEscrowState`]
///   unless the escrow is FUNDED.
/// - [`StateConflict::RequestInProgress`] if another request is active.
/// - [`EscrowError::InsufficientFunds`] if the amount exceeds the balance.
pub fn create(
    escrow: &mut Escrow,
    actor: &ActorId,
    input: NewFundRequest,
    now: Timestamp,
    rec: &mut Recorder,
) -> Result<FundRequestId, EscrowError> {
    let reason = validate_text("reason", &input.reason, MAX_REASON_LEN)?;
    let description = input.description.trim().to_string();
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(EscrowError::field(
            "description",
            format!("must not exceed {MAX_DESCRIPTION_LEN} characters"),
        ));
    }
    if input.document_refs.len() > MAX_DOCUMENT_REFS {
        return Err(EscrowError::field(
            "document_refs",
            format!("at most {MAX_DOCUMENT_REFS} documents per request"),
        ));
    }
    MinorUnits::positive(input.amount)?;

    if !escrow.is_participant(actor) {
        return Err(EscrowError::Authorization {
            escrow_id: escrow.id(),
            actor: actor.clone(),
            operation: "create_fund_request",
            required: "custodian or stakeholder",
        });
    }
    escrow.ensure_open()?;
    if let Some(active) = escrow.active_request() {
        return Err(StateConflict::RequestInProgress {
            escrow_id: escrow.id(),
            request_id: active.id,
        }
        .into());
    }
    if escrow.state() != EscrowState::Funded {
        return Err(StateConflict::InvalidEscrowState {
            escrow_id: escrow.id(),
            operation: "create_fund_request",
            state: escrow.state(),
        }
        .into());
    }
    let amount = escrow.ledger().check_available(escrow.id(), input.amount)?;

    let roster = ReviewCoordinator::assign_reviewers(escrow);
    let reviews = roster.iter().map(Review::pending).collect();
    let request_id = FundRequestId::new();
    let reviewers = roster.user_ids();
    escrow.fund_requests.push(FundRequest {
        id: request_id,
        amount,
        reason,
        description,
        document_refs: input.document_refs,
        requested_by: actor.clone(),
        requested_at: now,
        roster,
        reviews,
        state: RequestState::Created,
        decided_at: None,
        cancellation: None,
    });
    escrow.sync_state();

    tracing::info!(
        escrow_id = %escrow.id(),
        request_id = %request_id,
        amount = %amount,
        requested_by = %actor,
        "fund request created"
    );
    rec.record(
        actor,
        AuditKind::RequestCreated {
            request_id,
            amount,
            reviewers,
        },
        escrow,
        now,
    );
    Ok(request_id)
}

/// Apply the terminal decision to a request under review.
///
/// Approval debits the ledger and marks the request APPROVED in one step;
/// if the debit fails nothing is written. When the release exhausts the
/// balance the escrow closes.
///
/// Idempotent: if the request is already terminal, whatever the outcome
/// asked for, the call returns the existing state without side effects.
pub fn finalize(
    escrow: &mut Escrow,
    request_id: FundRequestId,
    outcome: Outcome,
    actor: &ActorId,
    now: Timestamp,
    rec: &mut Recorder,
) -> Result<RequestState, EscrowError> {
    let escrow_id = escrow.id();
    let request = escrow.request_or_not_found(request_id)?;
    let target = outcome.target();
    if request.state().is_terminal() {
        let state = request.state();
        tracing::debug!(%escrow_id, %request_id, %state, requested = %target, "finalize replayed; no change");
        return Ok(state);
    }
    let amount = request.amount;

    match outcome {
        Outcome::Approve => {
            escrow.ledger.apply_release(escrow_id, amount)?;
            escrow.request_mut(request_id)?.transition(escrow_id, target, now)?;
            escrow.sync_state();
            let remaining_amount = escrow.ledger().remaining_amount();
            tracing::info!(%escrow_id, %request_id, %amount, %remaining_amount, "fund request approved; funds released");
            metrics::counter!("escrow_requests_finalized_total", "outcome" => "approved").increment(1);
            metrics::counter!("escrow_releases_total", "currency" => escrow.ledger().currency().to_string())
                .increment(1);
            metrics::counter!(
                "escrow_released_minor_units_total",
                "currency" => escrow.ledger().currency().to_string()
            )
            .increment(amount.value().unsigned_abs());
            rec.record(
                actor,
                AuditKind::RequestApproved {
                    request_id,
                    amount,
                    remaining_amount,
                },
                escrow,
                now,
            );
            if escrow.state() == EscrowState::Closed {
                tracing::info!(%escrow_id, "escrow fully released; closed");
                rec.record(actor, AuditKind::EscrowClosed, escrow, now);
            }
        }
        Outcome::Reject => {
            escrow.request_mut(request_id)?.transition(escrow_id, target, now)?;
            escrow.sync_state();
            tracing::info!(%escrow_id, %request_id, "fund request rejected");
            metrics::counter!("escrow_requests_finalized_total", "outcome" => "rejected").increment(1);
            rec.record(actor, AuditKind::RequestRejected { request_id }, escrow, now);
        }
    }
    Ok(target)
}

/// Cancel an active request.
///
/// A withdrawal may be made only by the custodian; expiry only by the
/// system actor. Recorded reviews stay on the request.
pub fn cancel(
    escrow: &mut Escrow,
    request_id: FundRequestId,
    actor: &ActorId,
    cause: CancellationCause,
    reason: Option<String>,
    now: Timestamp,
    rec: &mut Recorder,
) -> Result<(), EscrowError> {
    let escrow_id = escrow.id();
    let reason = match reason {
        Some(r) if !r.trim().is_empty() => Some(validate_text("reason", &r, MAX_REASON_LEN)?),
        _ => None,
    };
    escrow.request_or_not_found(request_id)?;
    let permitted = match cause {
        CancellationCause::Withdrawn => escrow.is_custodian(actor),
        CancellationCause::Expired => actor.is_system(),
    };
    if !permitted {
        return Err(EscrowError::Authorization {
            escrow_id,
            actor: actor.clone(),
            operation: "cancel_fund_request",
            required: match cause {
                CancellationCause::Withdrawn => "custodian",
                CancellationCause::Expired => "system",
            },
        });
    }

    let request = escrow.request_mut(request_id)?;
    request.transition(escrow_id, RequestState::Cancelled, now)?;
    request.cancellation = Some(Cancellation {
        cause,
        cancelled_by: actor.clone(),
        reason,
    });
    escrow.sync_state();

    tracing::info!(%escrow_id, %request_id, %cause, cancelled_by = %actor, "fund request cancelled");
    metrics::counter!("escrow_requests_finalized_total", "outcome" => "cancelled").increment(1);
    rec.record(actor, AuditKind::RequestCancelled { request_id, cause }, escrow, now);
    Ok(())
}

/// Expire the active request if it was raised at least `ttl` before `now`.
///
/// Returns the expired request, or `None` when nothing was stale.
pub fn expire_if_stale(
    escrow: &mut Escrow,
    ttl: Duration,
    now: Timestamp,
    rec: &mut Recorder,
) -> Result<Option<FundRequestId>, EscrowError> {
    let Some(active) = escrow.active_request() else {
        return Ok(None);
    };
    if *active.requested_at.as_datetime() + ttl > *now.as_datetime() {
        return Ok(None);
    }
    let request_id = active.id;
    cancel(
        escrow,
        request_id,
        &ActorId::system(),
        CancellationCause::Expired,
        None,
        now,
        rec,
    )?;
    Ok(Some(request_id))
}
