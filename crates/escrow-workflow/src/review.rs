//! # Review Coordination
//!
//! When a fund request is created the current custodian and stakeholders
//! are frozen into its [`ReviewerRoster`]. Later stakeholder changes never
//! alter the roster of an existing request.
//!
//! ## Aggregation Rule
//!
//! - any REJECTED review rejects the request immediately;
//! - all reviews APPROVED **and** every required condition MET approves it;
//! - otherwise the request stays UNDER_REVIEW.
//!
//! Approval with a required condition still PENDING leaves the request open
//! until [`ReviewCoordinator::reevaluate`] is called after the condition is
//! met.

use serde::{Deserialize, Serialize};

use escrow_core::{ActorId, FundRequestId, Timestamp};

use crate::audit::{AuditKind, Recorder};
use crate::error::{EscrowError, StateConflict};
use crate::escrow::{Escrow, Participant};
use crate::lifecycle::{self, Outcome, RequestState};

const MAX_COMMENTS_LEN: usize = 2_000;

/// A reviewer's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// No decision yet.
    Pending,
    /// Approves the release.
    Approved,
    /// Rejects the release.
    Rejected,
}

impl Decision {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reviewer's slot on a fund request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    /// The reviewer.
    pub user_id: ActorId,
    /// Display name at the time the roster was frozen.
    pub name: String,
    /// Current decision.
    pub decision: Decision,
    /// Optional comments.
    pub comments: Option<String>,
    /// When the decision was recorded.
    pub reviewed_at: Option<Timestamp>,
}

impl Review {
    pub(crate) fn pending(reviewer: &Participant) -> Self {
        Self {
            user_id: reviewer.user_id.clone(),
            name: reviewer.name.clone(),
            decision: Decision::Pending,
            comments: None,
            reviewed_at: None,
        }
    }
}

/// Reviewers of one fund request, frozen at creation.
///
/// Has no mutators: once built it is read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewerRoster(Vec<Participant>);

impl ReviewerRoster {
    /// Whether `user_id` may review.
    pub fn contains(&self, user_id: &ActorId) -> bool {
        self.0.iter().any(|p| p.user_id == *user_id)
    }

    /// Reviewers in roster order.
    pub fn iter(&self) -> std::slice::Iter<'_, Participant> {
        self.0.iter()
    }

    /// Reviewer identifiers in roster order.
    pub fn user_ids(&self) -> Vec<ActorId> {
        self.0.iter().map(|p| p.user_id.clone()).collect()
    }

    /// Number of reviewers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the roster is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of aggregating the reviews of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Finalize as APPROVED.
    Approve,
    /// Finalize as REJECTED.
    Reject,
    /// Keep waiting.
    Undecided,
}

/// Assigns reviewers, records decisions and applies the aggregation rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewCoordinator;

impl ReviewCoordinator {
    /// Freeze the custodian followed by the current stakeholders.
    pub fn assign_reviewers(escrow: &Escrow) -> ReviewerRoster {
        let mut roster = vec![escrow.custodian().clone()];
        for s in escrow.stakeholders() {
            if !roster.iter().any(|p| p.user_id == s.user_id) {
                roster.push(s.clone());
            }
        }
        ReviewerRoster(roster)
    }

    /// Apply the aggregation rule.
    pub fn aggregate(reviews: &[Review], required_conditions_met: bool) -> Aggregate {
        if reviews.iter().any(|r| r.decision == Decision::Rejected) {
            return Aggregate::Reject;
        }
        if !reviews.is_empty()
            && reviews.iter().all(|r| r.decision == Decision::Approved)
            && required_conditions_met
        {
            return Aggregate::Approve;
        }
        Aggregate::Undecided
    }

    /// Record a reviewer's decision and finalize the request if the
    /// aggregation rule decides it.
    ///
    /// Returns the request state after the command.
    ///
    /// # Errors
    ///
    /// - [`EscrowError::Validation`] if `decision` is PENDING.
    /// - [`StateConflict::NotAReviewer`] if the actor is not on the roster.
    /// - [`StateConflict::AlreadyReviewed`] if the actor already decided.
    /// - [`StateConflict::RequestFinalized`] if the request is terminal.
    pub fn submit_review(
        escrow: &mut Escrow,
        request_id: FundRequestId,
        actor: &ActorId,
        decision: Decision,
        comments: Option<String>,
        now: Timestamp,
        rec: &mut Recorder,
    ) -> Result<RequestState, EscrowError> {
        if decision == Decision::Pending {
            return Err(EscrowError::field("decision", "must be APPROVED or REJECTED"));
        }
        let comments = match comments {
            Some(c) if !c.trim().is_empty() => {
                let trimmed = c.trim().to_string();
                if trimmed.chars().count() > MAX_COMMENTS_LEN {
                    return Err(EscrowError::field(
                        "comments",
                        format!("must not exceed {MAX_COMMENTS_LEN} characters"),
                    ));
                }
                Some(trimmed)
            }
            _ => None,
        };

        let escrow_id = escrow.id();
        let request = escrow.request_or_not_found(request_id)?;
        if !request.roster().contains(actor) {
            return Err(StateConflict::NotAReviewer {
                request_id,
                user_id: actor.clone(),
            }
            .into());
        }
        if let Some(existing) = request.review_of(actor) {
            if existing.decision != Decision::Pending {
                return Err(StateConflict::AlreadyReviewed {
                    request_id,
                    user_id: actor.clone(),
                    decision: existing.decision,
                }
                .into());
            }
        }
        if request.state().is_terminal() {
            return Err(StateConflict::RequestFinalized {
                request_id,
                state: request.state(),
            }
            .into());
        }

        let request = escrow.request_mut(request_id)?;
        if request.state() == RequestState::Created {
            request.transition(escrow_id, RequestState::UnderReview, now)?;
        }
        let review = request
            .review_of_mut(actor)
            .ok_or_else(|| EscrowError::InvariantViolation {
                escrow_id,
                detail: format!("roster member {actor} has no review slot on {request_id}"),
            })?;
        review.decision = decision;
        review.comments = comments;
        review.reviewed_at = Some(now);
        escrow.sync_state();

        tracing::info!(%escrow_id, %request_id, reviewer = %actor, %decision, "review submitted");
        metrics::counter!("escrow_reviews_submitted_total", "decision" => decision.as_str()).increment(1);
        rec.record(actor, AuditKind::ReviewSubmitted { request_id, decision }, escrow, now);

        Self::evaluate(escrow, request_id, actor, now, rec)
    }

    /// Re-run the aggregation rule on a request, typically after a required
    /// condition has been met.
    ///
    /// A terminal request is returned unchanged.
    ///
    /// # Errors
    ///
    /// [`EscrowError::Authorization`] unless the actor is on the roster or
    /// is the custodian.
    pub fn reevaluate(
        escrow: &mut Escrow,
        request_id: FundRequestId,
        actor: &ActorId,
        now: Timestamp,
        rec: &mut Recorder,
    ) -> Result<RequestState, EscrowError> {
        let request = escrow.request_or_not_found(request_id)?;
        if !request.roster().contains(actor) && !escrow.is_custodian(actor) {
            return Err(EscrowError::Authorization {
                escrow_id: escrow.id(),
                actor: actor.clone(),
                operation: "reevaluate_fund_request",
                required: "reviewer or custodian",
            });
        }
        if request.state().is_terminal() {
            return Ok(request.state());
        }
        Self::evaluate(escrow, request_id, actor, now, rec)
    }

    fn evaluate(
        escrow: &mut Escrow,
        request_id: FundRequestId,
        actor: &ActorId,
        now: Timestamp,
        rec: &mut Recorder,
    ) -> Result<RequestState, EscrowError> {
        let request = escrow.request_or_not_found(request_id)?;
        let verdict = Self::aggregate(request.reviews(), escrow.conditions().required_satisfied());
        let current = request.state();
        match verdict {
            Aggregate::Reject => lifecycle::finalize(escrow, request_id, Outcome::Reject, actor, now, rec),
            Aggregate::Approve => lifecycle::finalize(escrow, request_id, Outcome::Approve, actor, now, rec),
            Aggregate::Undecided => {
                let pending = escrow.conditions().pending_required();
                if !pending.is_empty() {
                    tracing::debug!(
                        escrow_id = %escrow.id(),
                        %request_id,
                        pending_conditions = pending.len(),
                        "release held by pending required conditions"
                    );
                }
                Ok(current)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::tests::{actor, funded_escrow, participant};
    use crate::escrow::EscrowState;
    use crate::lifecycle::NewFundRequest;
    use escrow_core::{DocumentRef, MinorUnits};

    fn review(decision: Decision) -> Review {
        Review {
            user_id: actor("x"),
            name: "X".into(),
            decision,
            comments: None,
            reviewed_at: None,
        }
    }

    fn open_request(escrow: &mut Escrow, amount: i64) -> FundRequestId {
        let mut rec = Recorder::default();
        lifecycle::create(
            escrow,
            &actor("bob"),
            NewFundRequest {
                amount,
                reason: "Inspection fee".into(),
                description: String::new(),
                document_refs: vec![],
            },
            Timestamp::now(),
            &mut rec,
        )
        .unwrap()
    }

    fn submit(escrow: &mut Escrow, id: FundRequestId, who: &str, d: Decision) -> Result<RequestState, EscrowError> {
        let mut rec = Recorder::default();
        ReviewCoordinator::submit_review(escrow, id, &actor(who), d, None, Timestamp::now(), &mut rec)
    }

    #[test]
    fn aggregation_rule() {
        use Decision::*;
        assert_eq!(ReviewCoordinator::aggregate(&[review(Approved), review(Approved)], true), Aggregate::Approve);
        assert_eq!(ReviewCoordinator::aggregate(&[review(Approved), review(Approved)], false), Aggregate::Undecided);
        assert_eq!(ReviewCoordinator::aggregate(&[review(Approved), review(Pending)], true), Aggregate::Undecided);
        assert_eq!(ReviewCoordinator::aggregate(&[review(Rejected), review(Pending)], true), Aggregate::Reject);
        assert_eq!(ReviewCoordinator::aggregate(&[review(Approved), review(Rejected)], false), Aggregate::Reject);
        assert_eq!(ReviewCoordinator::aggregate(&[], true), Aggregate::Undecided);
    }

    #[test]
    fn roster_is_custodian_then_stakeholders() {
        let mut e = funded_escrow(100);
        e.add_stakeholder(&actor("alice"), participant("carol")).unwrap();
        let roster = ReviewCoordinator::assign_reviewers(&e);
        assert_eq!(roster.user_ids(), vec![actor("alice"), actor("bob"), actor("carol")]);
        assert!(roster.contains(&actor("carol")));
        assert!(!roster.contains(&actor("mallory")));
    }

    #[test]
    fn unanimous_approval_releases() {
        let mut e = funded_escrow(100_000);
        let id = open_request(&mut e, 40_000);
        assert_eq!(submit(&mut e, id, "alice", Decision::Approved).unwrap(), RequestState::UnderReview);
        assert_eq!(e.state(), EscrowState::UnderReview);
        assert_eq!(submit(&mut e, id, "bob", Decision::Approved).unwrap(), RequestState::Approved);
        assert_eq!(e.ledger().remaining_amount(), MinorUnits::new(60_000));
        assert_eq!(e.state(), EscrowState::Funded);
    }

    #[test]
    fn single_rejection_finalizes_and_blocks_later_reviews() {
        let mut e = funded_escrow(100_000);
        let id = open_request(&mut e, 40_000);
        assert_eq!(submit(&mut e, id, "alice", Decision::Rejected).unwrap(), RequestState::Rejected);
        let err = submit(&mut e, id, "bob", Decision::Approved).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::StateConflict(StateConflict::RequestFinalized { .. })
        ));
        assert_eq!(e.ledger().released_amount(), MinorUnits::ZERO);
        assert_eq!(e.state(), EscrowState::Funded);
    }

    #[test]
    fn duplicate_and_foreign_reviews_are_refused() {
        let mut e = funded_escrow(100);
        let id = open_request(&mut e, 10);
        submit(&mut e, id, "alice", Decision::Approved).unwrap();
        assert!(matches!(
            submit(&mut e, id, "alice", Decision::Approved).unwrap_err(),
            EscrowError::StateConflict(StateConflict::AlreadyReviewed {
                decision: Decision::Approved,
                ..
            })
        ));
        assert!(matches!(
            submit(&mut e, id, "mallory", Decision::Approved).unwrap_err(),
            EscrowError::StateConflict(StateConflict::NotAReviewer { .. })
        ));
        assert!(matches!(
            submit(&mut e, id, "bob", Decision::Pending).unwrap_err(),
            EscrowError::Validation(_)
        ));
    }

    #[test]
    fn roster_is_frozen_against_stakeholder_changes() {
        let mut e = funded_escrow(100);
        let id = open_request(&mut e, 10);
        e.add_stakeholder(&actor("alice"), participant("carol")).unwrap();
        assert!(matches!(
            submit(&mut e, id, "carol", Decision::Approved).unwrap_err(),
            EscrowError::StateConflict(StateConflict::NotAReviewer { .. })
        ));
        assert_eq!(e.request(id).unwrap().roster().len(), 2);
    }

    #[test]
    fn pending_condition_holds_release_until_reevaluated() {
        let mut e = funded_escrow(100);
        let c = e.conditions.add("Inspection passed", true, Timestamp::now()).unwrap();
        let id = open_request(&mut e, 40);
        submit(&mut e, id, "alice", Decision::Approved).unwrap();
        assert_eq!(submit(&mut e, id, "bob", Decision::Approved).unwrap(), RequestState::UnderReview);
        assert_eq!(e.ledger().released_amount(), MinorUnits::ZERO);

        let mut rec = Recorder::default();
        assert_eq!(
            ReviewCoordinator::reevaluate(&mut e, id, &actor("alice"), Timestamp::now(), &mut rec).unwrap(),
            RequestState::UnderReview
        );
        assert!(rec.is_empty());

        let escrow_id = e.id();
        e.conditions
            .mark_met(
                escrow_id,
                c,
                DocumentRef::new("docs/inspection.pdf").unwrap(),
                &actor("alice"),
                Timestamp::now(),
            )
            .unwrap();
        assert_eq!(
            ReviewCoordinator::reevaluate(&mut e, id, &actor("bob"), Timestamp::now(), &mut rec).unwrap(),
            RequestState::Approved
        );
        assert_eq!(e.ledger().released_amount(), MinorUnits::new(40));
        // a second reevaluation is a no-op
        let before = e.clone();
        assert_eq!(
            ReviewCoordinator::reevaluate(&mut e, id, &actor("bob"), Timestamp::now(), &mut rec).unwrap(),
            RequestState::Approved
        );
        assert_eq!(e, before);
    }

    #[test]
    fn reevaluate_requires_reviewer() {
        let mut e = funded_escrow(100);
        let id = open_request(&mut e, 10);
        let mut rec = Recorder::default();
        assert!(matches!(
            ReviewCoordinator::reevaluate(&mut e, id, &actor("mallory"), Timestamp::now(), &mut rec),
            Err(EscrowError::Authorization { .. })
        ));
    }

    #[test]
    fn decision_serializes_screaming() {
        assert_eq!(serde_json::to_string(&Decision::Rejected).unwrap(), "\"REJECTED\"");
        assert_eq!(Decision::Pending.to_string(), "PENDING");
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn decision() -> impl Strategy<Value = Decision> {
        prop_oneof![
            Just(Decision::Pending),
            Just(Decision::Approved),
            Just(Decision::Rejected),
        ]
    }

    proptest! {
        #[test]
        fn approve_iff_unanimous_and_conditions_met(
            decisions in prop::collection::vec(decision(), 1..8),
            conditions_met in any::<bool>(),
        ) {
            let reviews: Vec<Review> = decisions
                .iter()
                .enumerate()
                .map(|(i, d)| Review {
                    user_id: ActorId::new(format!("reviewer-{i}")).unwrap(),
                    name: format!("Reviewer {i}"),
                    decision: *d,
                    comments: None,
                    reviewed_at: None,
                })
                .collect();
            let any_rejected = decisions.contains(&Decision::Rejected);
            let all_approved = decisions.iter().all(|d| *d == Decision::Approved);

            let verdict = ReviewCoordinator::aggregate(&reviews, conditions_met);
            prop_assert_eq!(verdict == Aggregate::Reject, any_rejected);
            prop_assert_eq!(verdict == Aggregate::Approve, all_approved && conditions_met);
        }
    }
}
