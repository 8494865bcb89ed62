//! # Escrow Aggregate
//!
//! An [`Escrow`] holds the ledger, the release conditions, the participants
//! and every fund request ever raised against it. All mutation goes through
//! methods on the aggregate or the lifecycle/review modules, which operate
//! on a working copy inside the per-escrow critical section.
//!
//! ## State Machine
//!
//! ```text
//! DRAFT ──fund──▶ FUNDED ──request──▶ REQUESTED ──first review──▶ UNDER_REVIEW
//!                   ▲                     │                          │
//!                   └───── rejected / cancelled / partial release ◀──┘
//!                                                                    │
//!                                         remaining = 0 ──▶ CLOSED ◀─┘
//! ```
//!
//! The escrow state is derived from the ledger and the active request by
//! [`Escrow::sync_state`], so the two can never disagree.

use serde::{Deserialize, Serialize};

use escrow_core::error::validate_text;
use escrow_core::{ActorId, CurrencyCode, EscrowId, FundRequestId, MinorUnits, Timestamp};

use crate::conditions::ConditionTracker;
use crate::error::{EscrowError, StateConflict};
use crate::ledger::EscrowLedger;
use crate::lifecycle::{FundRequest, RequestState};

const MAX_TITLE_LEN: usize = 200;
const MAX_NAME_LEN: usize = 200;

/// Escrow lifecycle state.
///
/// Terminal state: `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowState {
    /// Created; no funds deposited.
    Draft,
    /// Funds held; no active request.
    Funded,
    /// A fund request awaits its first review.
    Requested,
    /// A fund request has at least one review and no decision.
    UnderReview,
    /// Every deposited unit has been released. Terminal.
    Closed,
}

impl EscrowState {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Funded => "FUNDED",
            Self::Requested => "REQUESTED",
            Self::UnderReview => "UNDER_REVIEW",
            Self::Closed => "CLOSED",
        }
    }

    /// Whether no further commands are accepted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for EscrowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A custodian or stakeholder of an escrow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Identity issued by the authentication collaborator.
    pub user_id: ActorId,
    /// Display name recorded on reviews.
    pub name: String,
}

impl Participant {
    /// Create a participant with a validated display name.
    pub fn new(user_id: ActorId, name: &str) -> Result<Self, EscrowError> {
        Ok(Self {
            user_id,
            name: validate_text("name", name, MAX_NAME_LEN)?,
        })
    }
}

/// The escrow aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    pub(crate) id: EscrowId,
    pub(crate) title: String,
    pub(crate) custodian: Participant,
    pub(crate) stakeholders: Vec<Participant>,
    #[serde(flatten)]
    pub(crate) ledger: EscrowLedger,
    pub(crate) conditions: ConditionTracker,
    pub(crate) fund_requests: Vec<FundRequest>,
    pub(crate) state: EscrowState,
    pub(crate) version: u64,
    pub(crate) created_at: Timestamp,
    pub(crate) updated_at: Timestamp,
}

impl Escrow {
    /// Create a DRAFT escrow with an unfunded ledger.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] for a bad title or currency, a
    /// duplicate stakeholder, or a custodian listed as a stakeholder.
    pub fn create(
        title: &str,
        custodian: Participant,
        currency: &str,
        stakeholders: Vec<Participant>,
        now: Timestamp,
    ) -> Result<Self, EscrowError> {
        let title = validate_text("title", title, MAX_TITLE_LEN)?;
        let currency = CurrencyCode::new(currency)?;

        let mut unique: Vec<Participant> = Vec::with_capacity(stakeholders.len());
        for s in stakeholders {
            if s.user_id == custodian.user_id {
                return Err(EscrowError::field(
                    "stakeholders",
                    format!("{} is the custodian", s.user_id),
                ));
            }
            if unique.iter().any(|u| u.user_id == s.user_id) {
                return Err(EscrowError::field(
                    "stakeholders",
                    format!("{} is listed more than once", s.user_id),
                ));
            }
            unique.push(s);
        }

        Ok(Self {
            id: EscrowId::new(),
            title,
            custodian,
            stakeholders: unique,
            ledger: EscrowLedger::unfunded(currency),
            conditions: ConditionTracker::new(),
            fund_requests: Vec::new(),
            state: EscrowState::Draft,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────

    /// Escrow identifier.
    pub fn id(&self) -> EscrowId {
        self.id
    }

    /// Human-readable title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// The administrative owner.
    pub fn custodian(&self) -> &Participant {
        &self.custodian
    }

    /// Current stakeholders, in the order they were added.
    pub fn stakeholders(&self) -> &[Participant] {
        &self.stakeholders
    }

    /// The ledger.
    pub fn ledger(&self) -> &EscrowLedger {
        &self.ledger
    }

    /// Release conditions.
    pub fn conditions(&self) -> &ConditionTracker {
        &self.conditions
    }

    /// Every fund request ever raised, oldest first.
    pub fn fund_requests(&self) -> &[FundRequest] {
        &self.fund_requests
    }

    /// Current state.
    pub fn state(&self) -> EscrowState {
        self.state
    }

    /// Monotonic version, incremented once per committed command.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Creation time.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Time of the last committed command.
    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Look up a fund request.
    pub fn request(&self, request_id: FundRequestId) -> Option<&FundRequest> {
        self.fund_requests.iter().find(|r| r.id == request_id)
    }

    /// The request in CREATED or UNDER_REVIEW, if any.
    pub fn active_request(&self) -> Option<&FundRequest> {
        self.fund_requests.iter().find(|r| r.state().is_active())
    }

    // ── Roles ──────────────────────────────────────────────────────────

    /// Whether the actor is the custodian.
    pub fn is_custodian(&self, actor: &ActorId) -> bool {
        self.custodian.user_id == *actor
    }

    /// Whether the actor is a current stakeholder.
    pub fn is_stakeholder(&self, actor: &ActorId) -> bool {
        self.stakeholders.iter().any(|s| s.user_id == *actor)
    }

    /// Whether the actor is the custodian or a current stakeholder.
    pub fn is_participant(&self, actor: &ActorId) -> bool {
        self.is_custodian(actor) || self.is_stakeholder(actor)
    }

    pub(crate) fn require_custodian(&self, actor: &ActorId, operation: &'static str) -> Result<(), EscrowError> {
        if self.is_custodian(actor) {
            return Ok(());
        }
        Err(EscrowError::Authorization {
            escrow_id: self.id,
            actor: actor.clone(),
            operation,
            required: "custodian",
        })
    }

    pub(crate) fn ensure_open(&self) -> Result<(), EscrowError> {
        if self.state.is_terminal() {
            return Err(StateConflict::EscrowClosed { escrow_id: self.id }.into());
        }
        Ok(())
    }

    pub(crate) fn request_mut(&mut self, request_id: FundRequestId) -> Result<&mut FundRequest, EscrowError> {
        let escrow_id = self.id;
        self.fund_requests
            .iter_mut()
            .find(|r| r.id == request_id)
            .ok_or(EscrowError::RequestNotFound {
                escrow_id,
                request_id,
            })
    }

    pub(crate) fn request_or_not_found(&self, request_id: FundRequestId) -> Result<&FundRequest, EscrowError> {
        self.request(request_id).ok_or(EscrowError::RequestNotFound {
            escrow_id: self.id,
            request_id,
        })
    }

    // ── Commands ───────────────────────────────────────────────────────

    /// Deposit the escrow total and move DRAFT → FUNDED.
    ///
    /// # Errors
    ///
    /// [`EscrowError::Authorization`] unless the actor is the custodian;
    /// [`StateConflict::InvalidEscrowState`] unless the escrow is DRAFT;
    /// [`EscrowError::Validation`] for a non-positive total or when no
    /// stakeholder has been assigned.
    pub fn fund(&mut self, actor: &ActorId, total_amount: i64) -> Result<(), EscrowError> {
        self.require_custodian(actor, "fund")?;
        self.ensure_open()?;
        if self.state != EscrowState::Draft {
            return Err(StateConflict::InvalidEscrowState {
                escrow_id: self.id,
                operation: "fund",
                state: self.state,
            }
            .into());
        }
        if self.stakeholders.is_empty() {
            return Err(EscrowError::field(
                "stakeholders",
                "at least one stakeholder must be assigned before funding",
            ));
        }
        self.ledger = EscrowLedger::open(total_amount, self.ledger.currency().as_str())?;
        self.sync_state();
        Ok(())
    }

    /// Add a stakeholder. Reviewer rosters of existing requests are not
    /// affected.
    pub fn add_stakeholder(&mut self, actor: &ActorId, stakeholder: Participant) -> Result<(), EscrowError> {
        self.require_custodian(actor, "add_stakeholder")?;
        self.ensure_open()?;
        if self.is_participant(&stakeholder.user_id) {
            return Err(EscrowError::field(
                "user_id",
                format!("{} already participates in this escrow", stakeholder.user_id),
            ));
        }
        self.stakeholders.push(stakeholder);
        Ok(())
    }

    /// Remove a stakeholder. A funded escrow keeps at least one.
    pub fn remove_stakeholder(&mut self, actor: &ActorId, user_id: &ActorId) -> Result<(), EscrowError> {
        self.require_custodian(actor, "remove_stakeholder")?;
        self.ensure_open()?;
        let Some(index) = self.stakeholders.iter().position(|s| s.user_id == *user_id) else {
            return Err(EscrowError::field(
                "user_id",
                format!("{user_id} is not a stakeholder of this escrow"),
            ));
        };
        if self.state != EscrowState::Draft && self.stakeholders.len() == 1 {
            return Err(EscrowError::field(
                "user_id",
                "a funded escrow must keep at least one stakeholder",
            ));
        }
        self.stakeholders.remove(index);
        Ok(())
    }

    // ── Invariants ─────────────────────────────────────────────────────

    /// Recompute the escrow state from the ledger and the active request.
    pub(crate) fn sync_state(&mut self) {
        if self.state == EscrowState::Draft && self.ledger.total_amount().is_zero() {
            return;
        }
        self.state = match self.active_request().map(FundRequest::state) {
            Some(RequestState::Created) => EscrowState::Requested,
            Some(_) => EscrowState::UnderReview,
            None if self.ledger.is_exhausted() => EscrowState::Closed,
            None => EscrowState::Funded,
        };
    }

    /// Check every structural invariant of the aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvariantViolation`] naming the first broken
    /// invariant.
    pub fn verify_invariants(&self) -> Result<(), EscrowError> {
        self.ledger.verify(self.id)?;
        let broken = |detail: String| {
            Err(EscrowError::InvariantViolation {
                escrow_id: self.id,
                detail,
            })
        };

        let active = self.fund_requests.iter().filter(|r| r.state().is_active()).count();
        if active > 1 {
            return broken(format!("{active} fund requests are active at once"));
        }

        let mut approved = MinorUnits::ZERO;
        for r in self.fund_requests.iter().filter(|r| r.state() == RequestState::Approved) {
            approved = match approved.checked_add(r.amount) {
                Ok(sum) => sum,
                Err(e) => return broken(e.to_string()),
            };
        }
        if approved != self.ledger.released_amount() {
            return broken(format!(
                "approved requests total {approved} but ledger released {}",
                self.ledger.released_amount()
            ));
        }

        if self.state == EscrowState::Closed && !self.ledger.remaining_amount().is_zero() {
            return broken(format!(
                "escrow closed with remaining balance {}",
                self.ledger.remaining_amount()
            ));
        }
        Ok(())
    }
}
