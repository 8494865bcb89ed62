//! # Escrow Service
//!
//! The command and query surface of the engine. Every mutating command:
//!
//! - resolves the escrow and takes its command lock through
//!   [`EscrowStore::execute`],
//! - checks the caller's optional `expected_version`,
//! - runs against a working copy and commits all-or-nothing,
//! - then, outside the lock, queues one [`EscrowEvent`] per committed
//!   transition and a [`ReleaseInstruction`] per approval.
//!
//! Queries return the last committed escrow and never wait on commands.

use std::sync::Arc;

use escrow_core::{ActorId, ConditionId, DocumentRef, EscrowId, FundRequestId, Timestamp};

use crate::audit::{AuditKind, AuditQuery, AuditTrail, Recorder};
use crate::config::WorkflowConfig;
use crate::dispatch::{DispatchHandle, EscrowEvent, ReleaseInstruction};
use crate::error::EscrowError;
use crate::escrow::{Escrow, EscrowState, Participant};
use crate::lifecycle::{self, CancellationCause, NewFundRequest, RequestState};
use crate::review::{Decision, ReviewCoordinator};
use crate::snapshot::SnapshotStore;
use crate::store::{Committed, EscrowRepository, EscrowStore, InMemoryEscrowRepository};

/// Input for [`EscrowService::create_escrow`]. The calling actor becomes
/// the custodian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateEscrow {
    /// Human-readable title.
    pub title: String,
    /// Display name of the custodian.
    pub custodian_name: String,
    /// ISO 4217 currency code; immutable afterwards.
    pub currency: String,
    /// Initial stakeholders.
    pub stakeholders: Vec<Participant>,
}

/// The escrow workflow engine.
#[derive(Debug)]
pub struct EscrowService {
    store: EscrowStore,
    config: WorkflowConfig,
    dispatch: Option<DispatchHandle>,
}

impl EscrowService {
    /// An engine over in-memory storage with no dispatcher attached.
    pub fn new(config: WorkflowConfig) -> Self {
        Self::with_repository(config, Arc::new(InMemoryEscrowRepository::new()))
    }

    /// An engine over the given repository.
    pub fn with_repository(config: WorkflowConfig, repository: Arc<dyn EscrowRepository>) -> Self {
        Self {
            store: EscrowStore::new(
                repository,
                Arc::new(AuditTrail::new()),
                Arc::new(SnapshotStore::new()),
            ),
            config,
            dispatch: None,
        }
    }

    /// Attach a post-commit dispatcher.
    pub fn with_dispatcher(mut self, handle: DispatchHandle) -> Self {
        self.dispatch = Some(handle);
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    // ── Escrow commands ────────────────────────────────────────────────

    /// Create a DRAFT escrow with the actor as custodian.
    pub fn create_escrow(&self, actor: &ActorId, input: CreateEscrow) -> Result<Arc<Escrow>, EscrowError> {
        let op = "create_escrow";
        let now = Timestamp::now();
        let result = Participant::new(actor.clone(), &input.custodian_name)
            .and_then(|custodian| Escrow::create(&input.title, custodian, &input.currency, input.stakeholders, now))
            .and_then(|escrow| {
                let mut rec = Recorder::default();
                rec.record(
                    actor,
                    AuditKind::EscrowCreated {
                        currency: escrow.ledger().currency().clone(),
                    },
                    &escrow,
                    now,
                );
                for s in escrow.stakeholders() {
                    rec.record(
                        actor,
                        AuditKind::StakeholderAdded {
                            user_id: s.user_id.clone(),
                        },
                        &escrow,
                        now,
                    );
                }
                self.store.create(escrow, rec)
            });
        match result {
            Ok(committed) => {
                self.after_commit(op, None, &committed);
                Ok(committed.escrow)
            }
            Err(e) => Err(self.rejected(op, None, actor, e)),
        }
    }

    /// Deposit the escrow total; DRAFT → FUNDED.
    pub fn fund(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        total_amount: i64,
        expected_version: Option<u64>,
    ) -> Result<Arc<Escrow>, EscrowError> {
        self.run("fund", escrow_id, actor, expected_version, |e, rec, now| {
            e.fund(actor, total_amount)?;
            let total_amount = e.ledger().total_amount();
            rec.record(actor, AuditKind::EscrowFunded { total_amount }, e, now);
            Ok(())
        })
        .map(|(escrow, ())| escrow)
    }

    /// Add a stakeholder. Existing reviewer rosters are unaffected.
    pub fn add_stakeholder(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        stakeholder: Participant,
        expected_version: Option<u64>,
    ) -> Result<Arc<Escrow>, EscrowError> {
        self.run("add_stakeholder", escrow_id, actor, expected_version, |e, rec, now| {
            let user_id = stakeholder.user_id.clone();
            e.add_stakeholder(actor, stakeholder)?;
            rec.record(actor, AuditKind::StakeholderAdded { user_id }, e, now);
            Ok(())
        })
        .map(|(escrow, ())| escrow)
    }

    /// Remove a stakeholder. Existing reviewer rosters are unaffected.
    pub fn remove_stakeholder(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        user_id: &ActorId,
        expected_version: Option<u64>,
    ) -> Result<Arc<Escrow>, EscrowError> {
        self.run("remove_stakeholder", escrow_id, actor, expected_version, |e, rec, now| {
            e.remove_stakeholder(actor, user_id)?;
            rec.record(
                actor,
                AuditKind::StakeholderRemoved {
                    user_id: user_id.clone(),
                },
                e,
                now,
            );
            Ok(())
        })
        .map(|(escrow, ())| escrow)
    }

    // ── Conditions ─────────────────────────────────────────────────────

    /// Attach a release condition. Custodian only; not once CLOSED.
    pub fn add_condition(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        description: &str,
        required: bool,
        expected_version: Option<u64>,
    ) -> Result<(Arc<Escrow>, ConditionId), EscrowError> {
        self.run("add_condition", escrow_id, actor, expected_version, |e, rec, now| {
            e.require_custodian(actor, "add_condition")?;
            e.ensure_open()?;
            let condition_id = e.conditions.add(description, required, now)?;
            rec.record(actor, AuditKind::ConditionAdded { condition_id, required }, e, now);
            Ok(condition_id)
        })
    }

    /// Mark a condition MET with evidence. Never finalizes a request; call
    /// [`Self::reevaluate_request`] afterwards.
    pub fn mark_condition_met(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        condition_id: ConditionId,
        evidence_ref: DocumentRef,
        expected_version: Option<u64>,
    ) -> Result<Arc<Escrow>, EscrowError> {
        self.run("mark_condition_met", escrow_id, actor, expected_version, |e, rec, now| {
            e.require_custodian(actor, "mark_condition_met")?;
            e.ensure_open()?;
            let id = e.id();
            if e.conditions.mark_met(id, condition_id, evidence_ref.clone(), actor, now)? {
                rec.record(
                    actor,
                    AuditKind::ConditionMet {
                        condition_id,
                        evidence_ref,
                    },
                    e,
                    now,
                );
            }
            Ok(())
        })
        .map(|(escrow, ())| escrow)
    }

    /// Revert a condition to PENDING.
    pub fn mark_condition_pending(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        condition_id: ConditionId,
        expected_version: Option<u64>,
    ) -> Result<Arc<Escrow>, EscrowError> {
        self.run("mark_condition_pending", escrow_id, actor, expected_version, |e, rec, now| {
            e.require_custodian(actor, "mark_condition_pending")?;
            e.ensure_open()?;
            let id = e.id();
            if e.conditions.mark_pending(id, condition_id)? {
                rec.record(actor, AuditKind::ConditionReverted { condition_id }, e, now);
            }
            Ok(())
        })
        .map(|(escrow, ())| escrow)
    }

    // ── Fund requests ──────────────────────────────────────────────────

    /// Raise a fund request and freeze its reviewer roster.
    pub fn create_fund_request(
        &self,
        escrow_id: EscrowId,
        actor: &ActorId,
        input: NewFundRequest,
        expected_version: Option<u64>,
    ) -> Result<(Arc<Escrow>, FundRequestId), EscrowError> {
        self.run("create_fund_request", escrow_id, actor, expected_version, |e, rec, now| {
            lifecycle::create(e, actor, input, now, rec)
        })
    }

    /// Record a reviewer's decision and apply the aggregation rule.
    pub fn submit_review(
        &self,
        escrow_id: EscrowId,
        request_id: FundRequestId,
        actor: &ActorId,
        decision: Decision,
        comments: Option<String>,
        expected_version: Option<u64>,
    ) -> Result<(Arc<Escrow>, RequestState), EscrowError> {
        self.run("submit_review", escrow_id, actor, expected_version, |e, rec, now| {
            ReviewCoordinator::submit_review(e, request_id, actor, decision, comments, now, rec)
        })
    }

    /// Re-run the aggregation rule without recording a decision.
    pub fn reevaluate_request(
        &self,
        escrow_id: EscrowId,
        request_id: FundRequestId,
        actor: &ActorId,
        expected_version: Option<u64>,
    ) -> Result<(Arc<Escrow>, RequestState), EscrowError> {
        self.run("reevaluate_request", escrow_id, actor, expected_version, |e, rec, now| {
            ReviewCoordinator::reevaluate(e, request_id, actor, now, rec)
        })
    }

    /// Withdraw an active request. Custodian only.
    pub fn cancel_request(
        &self,
        escrow_id: EscrowId,
        request_id: FundRequestId,
        actor: &ActorId,
        reason: Option<String>,
        expected_version: Option<u64>,
    ) -> Result<Arc<Escrow>, EscrowError> {
        self.run("cancel_request", escrow_id, actor, expected_version, |e, rec, now| {
            lifecycle::cancel(e, request_id, actor, CancellationCause::Withdrawn, reason, now, rec)
        })
        .map(|(escrow, ())| escrow)
    }

    /// Expire every active request raised at least `request_ttl` before
    /// `now`. A no-op when no TTL is configured.
    ///
    /// Failures on one escrow are logged and do not stop the sweep.
    pub fn expire_stale_requests(&self, now: Timestamp) -> Vec<(EscrowId, FundRequestId)> {
        let Some(ttl) = self.config.request_ttl else {
            return Vec::new();
        };
        let system = ActorId::system();
        let mut expired = Vec::new();
        for escrow in self.store.list() {
            let stale = escrow
                .active_request()
                .is_some_and(|r| *r.requested_at.as_datetime() + ttl <= *now.as_datetime());
            if !stale {
                continue;
            }
            let escrow_id = escrow.id();
            let result = self
                .store
                .execute(escrow_id, None, now, |e, rec| lifecycle::expire_if_stale(e, ttl, now, rec));
            match result {
                Ok(committed) => {
                    self.after_commit("expire_request", None, &committed);
                    if let Some(request_id) = committed.value {
                        expired.push((escrow_id, request_id));
                    }
                }
                Err(e) => {
                    self.rejected("expire_request", Some(escrow_id), &system, e);
                }
            }
        }
        expired
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// The last committed state of an escrow.
    pub fn get_escrow_state(&self, escrow_id: EscrowId) -> Result<Arc<Escrow>, EscrowError> {
        self.store.get(escrow_id)
    }

    /// Every escrow, oldest first.
    pub fn list_escrows(&self) -> Vec<Arc<Escrow>> {
        self.store.list()
    }

    /// Audit entries of an escrow from `from_seq` on.
    pub fn get_audit_trail(&self, escrow_id: EscrowId, from_seq: u64) -> Result<AuditQuery, EscrowError> {
        self.store.get(escrow_id)?;
        Ok(self.store.audit().query(escrow_id, from_seq))
    }

    /// Verify the escrow's audit hash chain; returns the entry count.
    pub fn verify_audit_chain(&self, escrow_id: EscrowId) -> Result<u64, EscrowError> {
        self.store.get(escrow_id)?;
        self.store.audit().verify_chain(escrow_id).map_err(|e| {
            tracing::error!(target: "escrow::alert", %escrow_id, error = %e, "audit chain verification failed");
            metrics::counter!("escrow_invariant_violations_total").increment(1);
            e
        })
    }

    /// The escrow exactly as it was after audit entry `sequence`.
    pub fn reconstruct_at(&self, escrow_id: EscrowId, sequence: u64) -> Result<Escrow, EscrowError> {
        self.store.get(escrow_id)?;
        let entry = self.store.audit().entry(escrow_id, sequence).ok_or_else(|| {
            EscrowError::field("sequence", format!("escrow {escrow_id} has no audit entry {sequence}"))
        })?;
        self.store.snapshots().get(escrow_id, &entry.after)
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn run<R>(
        &self,
        op: &'static str,
        escrow_id: EscrowId,
        actor: &ActorId,
        expected_version: Option<u64>,
        command: impl FnOnce(&mut Escrow, &mut Recorder, Timestamp) -> Result<R, EscrowError>,
    ) -> Result<(Arc<Escrow>, R), EscrowError> {
        let now = Timestamp::now();
        let mut from = None;
        let result = self.store.execute(escrow_id, expected_version, now, |e, rec| {
            from = Some(e.state());
            command(e, rec, now)
        });
        match result {
            Ok(committed) => {
                self.after_commit(op, from, &committed);
                Ok((committed.escrow, committed.value))
            }
            Err(e) => Err(self.rejected(op, Some(escrow_id), actor, e)),
        }
    }

    fn after_commit<R>(&self, op: &'static str, from: Option<EscrowState>, committed: &Committed<R>) {
        let escrow = &committed.escrow;
        if committed.entries.is_empty() {
            tracing::debug!(op, escrow_id = %escrow.id(), version = escrow.version(), "command changed nothing");
            metrics::counter!("escrow_commands_total", "op" => op, "outcome" => "unchanged").increment(1);
            return;
        }

        let kinds: Vec<&'static str> = committed.entries.iter().map(|e| e.kind.name()).collect();
        tracing::info!(
            op,
            escrow_id = %escrow.id(),
            from = from.map(|s| s.as_str()).unwrap_or("NONE"),
            to = %escrow.state(),
            version = escrow.version(),
            transitions = ?kinds,
            "escrow command committed"
        );
        metrics::counter!("escrow_commands_total", "op" => op, "outcome" => "committed").increment(1);

        let Some(dispatch) = &self.dispatch else {
            return;
        };
        for entry in &committed.entries {
            if let AuditKind::RequestApproved { request_id, amount, .. } = &entry.kind {
                if let Some(request) = escrow.request(*request_id) {
                    dispatch.release(ReleaseInstruction {
                        escrow_id: escrow.id(),
                        request_id: *request_id,
                        amount: *amount,
                        currency: escrow.ledger().currency().clone(),
                        requested_by: request.requested_by.clone(),
                    });
                }
            }
            dispatch.notify(EscrowEvent::from_entry(entry, escrow.version()));
        }
    }

    fn rejected(&self, op: &'static str, escrow_id: Option<EscrowId>, actor: &ActorId, error: EscrowError) -> EscrowError {
        let outcome = error.kind().to_ascii_lowercase();
        metrics::counter!("escrow_commands_total", "op" => op, "outcome" => outcome).increment(1);
        if !error.is_fatal() {
            tracing::warn!(
                op,
                escrow_id = ?escrow_id,
                %actor,
                code = error.kind(),
                error = %error,
                "escrow command rejected"
            );
        }
        error
    }
}
