//! # Audit Trail
//!
//! Append-only log of every committed transition, keyed by
//! `(escrow_id, sequence)`. Sequences start at 1 and are contiguous per
//! escrow. Each entry references content-addressed snapshots of the escrow
//! before and after the transition, so any historical state can be rebuilt
//! by replay (see [`crate::snapshot`]).
//!
//! ## Tamper Evidence
//!
//! Entries form a per-escrow hash chain. Each entry stores the digest of its
//! predecessor (the zero digest for sequence 1) and its own digest:
//!
//! ```text
//! entry_digest = SHA-256(previous_digest || canonical(entry body))
//! ```
//!
//! [`AuditTrail::verify_chain`] recomputes every link.
//!
//! ## Queries
//!
//! [`AuditTrail::query`] returns an [`AuditQuery`] bounded at the log length
//! when the query was made. Iterating it reads entries one at a time, and
//! iterating again restarts from `from_seq`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use escrow_core::{
    ActorId, CanonicalBytes, ConditionId, ContentDigest, CurrencyCode, DocumentRef, EscrowId,
    FundRequestId, MinorUnits, Timestamp,
};

use crate::error::EscrowError;
use crate::escrow::Escrow;
use crate::lifecycle::CancellationCause;
use crate::review::Decision;

/// What a committed transition did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    /// Escrow created in DRAFT.
    EscrowCreated {
        /// Ledger currency.
        currency: CurrencyCode,
    },
    /// Escrow funded.
    EscrowFunded {
        /// Deposited total.
        total_amount: MinorUnits,
    },
    /// Stakeholder added.
    StakeholderAdded {
        /// The new stakeholder.
        user_id: ActorId,
    },
    /// Stakeholder removed.
    StakeholderRemoved {
        /// The removed stakeholder.
        user_id: ActorId,
    },
    /// Release condition attached.
    ConditionAdded {
        /// The condition.
        condition_id: ConditionId,
        /// Whether it gates releases.
        required: bool,
    },
    /// Release condition met.
    ConditionMet {
        /// The condition.
        condition_id: ConditionId,
        /// Supporting evidence.
        evidence_ref: DocumentRef,
    },
    /// Release condition reverted to PENDING.
    ConditionReverted {
        /// The condition.
        condition_id: ConditionId,
    },
    /// Fund request raised and reviewers assigned.
    RequestCreated {
        /// The request.
        request_id: FundRequestId,
        /// Requested amount.
        amount: MinorUnits,
        /// Frozen roster.
        reviewers: Vec<ActorId>,
    },
    /// Review recorded.
    ReviewSubmitted {
        /// The request.
        request_id: FundRequestId,
        /// The decision.
        decision: Decision,
    },
    /// Request approved and funds released.
    RequestApproved {
        /// The request.
        request_id: FundRequestId,
        /// Released amount.
        amount: MinorUnits,
        /// Balance after the release.
        remaining_amount: MinorUnits,
    },
    /// Request rejected.
    RequestRejected {
        /// The request.
        request_id: FundRequestId,
    },
    /// Request cancelled or expired.
    RequestCancelled {
        /// The request.
        request_id: FundRequestId,
        /// Withdrawal or expiry.
        cause: CancellationCause,
    },
    /// Escrow fully released.
    EscrowClosed,
}

impl AuditKind {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EscrowCreated { .. } => "ESCROW_CREATED",
            Self::EscrowFunded { .. } => "ESCROW_FUNDED",
            Self::StakeholderAdded { .. } => "STAKEHOLDER_ADDED",
            Self::StakeholderRemoved { .. } => "STAKEHOLDER_REMOVED",
            Self::ConditionAdded { .. } => "CONDITION_ADDED",
            Self::ConditionMet { .. } => "CONDITION_MET",
            Self::ConditionReverted { .. } => "CONDITION_REVERTED",
            Self::RequestCreated { .. } => "REQUEST_CREATED",
            Self::ReviewSubmitted { .. } => "REVIEW_SUBMITTED",
            Self::RequestApproved { .. } => "REQUEST_APPROVED",
            Self::RequestRejected { .. } => "REQUEST_REJECTED",
            Self::RequestCancelled { .. } => "REQUEST_CANCELLED",
            Self::EscrowClosed => "ESCROW_CLOSED",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One transition captured inside a command, before commit.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Who caused it.
    pub actor: ActorId,
    /// What happened.
    pub kind: AuditKind,
    /// When it happened.
    pub at: Timestamp,
    /// The working copy right after it.
    pub snapshot: Escrow,
}

/// Collects the transitions of one command against a working copy.
///
/// Discarded with the working copy if the command fails.
#[derive(Debug, Default)]
pub struct Recorder {
    transitions: Vec<Transition>,
}

impl Recorder {
    /// Capture a transition and the state it produced.
    pub fn record(&mut self, actor: &ActorId, kind: AuditKind, escrow: &Escrow, at: Timestamp) {
        self.transitions.push(Transition {
            actor: actor.clone(),
            kind,
            at,
            snapshot: escrow.clone(),
        });
    }

    /// Number of captured transitions.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Whether the command changed nothing.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Consume the recorder.
    pub fn into_transitions(self) -> Vec<Transition> {
        self.transitions
    }
}

/// Input to [`AuditTrail::append`]; the trail assigns sequence and chain.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// The escrow.
    pub escrow_id: EscrowId,
    /// Who caused the transition.
    pub actor: ActorId,
    /// What happened.
    pub kind: AuditKind,
    /// Snapshot before the transition; `None` for creation.
    pub before: Option<ContentDigest>,
    /// Snapshot after the transition.
    pub after: ContentDigest,
    /// When it happened.
    pub timestamp: Timestamp,
}

/// A committed, chained audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// The escrow.
    pub escrow_id: EscrowId,
    /// Position in the escrow's log, starting at 1.
    pub sequence: u64,
    /// When the transition happened.
    pub timestamp: Timestamp,
    /// Who caused it (the system actor for expiry).
    pub actor: ActorId,
    /// What happened.
    pub kind: AuditKind,
    /// Snapshot reference before the transition.
    pub before: Option<ContentDigest>,
    /// Snapshot reference after the transition.
    pub after: ContentDigest,
    /// Digest of the preceding entry.
    pub previous_digest: ContentDigest,
    /// Digest of this entry.
    pub entry_digest: ContentDigest,
}

#[derive(Serialize)]
struct EntryBody<'a> {
    escrow_id: &'a EscrowId,
    sequence: u64,
    timestamp: &'a Timestamp,
    actor: &'a ActorId,
    kind: &'a AuditKind,
    before: &'a Option<ContentDigest>,
    after: &'a ContentDigest,
}

impl AuditEntry {
    fn compute_digest(&self) -> Result<ContentDigest, EscrowError> {
        let body = CanonicalBytes::new(&EntryBody {
            escrow_id: &self.escrow_id,
            sequence: self.sequence,
            timestamp: &self.timestamp,
            actor: &self.actor,
            kind: &self.kind,
            before: &self.before,
            after: &self.after,
        })?;
        Ok(ContentDigest::chain(&self.previous_digest, &body))
    }
}

type EscrowLog = Arc<RwLock<Vec<AuditEntry>>>;

/// Append-only store of audit entries.
#[derive(Debug, Default)]
pub struct AuditTrail {
    logs: RwLock<HashMap<EscrowId, EscrowLog>>,
}

impl AuditTrail {
    /// An empty trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next entry of an escrow's log.
    ///
    /// Callers serialize appends per escrow by holding the escrow's command
    /// lock.
    pub fn append(&self, record: AuditRecord) -> Result<AuditEntry, EscrowError> {
        let escrow_id = record.escrow_id;
        let staged = self.stage(vec![record])?;
        let entry = staged.last().cloned().ok_or_else(|| EscrowError::InvariantViolation {
            escrow_id,
            detail: "staging produced no audit entry".to_string(),
        })?;
        self.commit(staged);
        Ok(entry)
    }

    /// Chain `records` onto the current end of their escrow's log without
    /// appending them. Every record must belong to the same escrow.
    ///
    /// Nothing is visible to readers until [`Self::commit`].
    pub fn stage(&self, records: Vec<AuditRecord>) -> Result<Vec<AuditEntry>, EscrowError> {
        let Some(escrow_id) = records.first().map(|r| r.escrow_id) else {
            return Ok(Vec::new());
        };
        let (mut sequence, mut previous_digest) = match self.logs.read().get(&escrow_id) {
            Some(log) => match log.read().last() {
                Some(last) => (last.sequence, last.entry_digest),
                None => (0, ContentDigest::ZERO),
            },
            None => (0, ContentDigest::ZERO),
        };
        let mut staged = Vec::with_capacity(records.len());
        for record in records {
            if record.escrow_id != escrow_id {
                return Err(EscrowError::InvariantViolation {
                    escrow_id,
                    detail: format!("audit record for escrow {} staged with {escrow_id}", record.escrow_id),
                });
            }
            sequence += 1;
            let mut entry = AuditEntry {
                escrow_id,
                sequence,
                timestamp: record.timestamp,
                actor: record.actor,
                kind: record.kind,
                before: record.before,
                after: record.after,
                previous_digest,
                entry_digest: ContentDigest::ZERO,
            };
            entry.entry_digest = entry.compute_digest()?;
            previous_digest = entry.entry_digest;
            staged.push(entry);
        }
        Ok(staged)
    }

    /// Append entries produced by [`Self::stage`]. The only mutator.
    ///
    /// The escrow's command lock must be held from `stage` through
    /// `commit`, so the log's end has not moved in between.
    pub fn commit(&self, entries: Vec<AuditEntry>) {
        let Some(first) = entries.first() else {
            return;
        };
        let log = self.log_for(first.escrow_id);
        let mut log = log.write();
        debug_assert_eq!(first.sequence, log.len() as u64 + 1);
        log.extend(entries);
    }

    /// Entries of an escrow with `sequence >= from_seq`, in order.
    pub fn query(&self, escrow_id: EscrowId, from_seq: u64) -> AuditQuery {
        let log = self.logs.read().get(&escrow_id).cloned();
        let upto = log.as_ref().map(|l| l.read().len()).unwrap_or(0);
        AuditQuery {
            log,
            start: from_seq.max(1) as usize - 1,
            upto,
        }
    }

    /// The entry at `sequence`.
    pub fn entry(&self, escrow_id: EscrowId, sequence: u64) -> Option<AuditEntry> {
        if sequence == 0 {
            return None;
        }
        let log = self.logs.read().get(&escrow_id).cloned()?;
        let entries = log.read();
        entries.get(sequence as usize - 1).cloned()
    }

    /// Number of entries for an escrow.
    pub fn len(&self, escrow_id: EscrowId) -> u64 {
        self.logs
            .read()
            .get(&escrow_id)
            .map(|l| l.read().len() as u64)
            .unwrap_or(0)
    }

    /// Recompute every link of an escrow's chain.
    ///
    /// Returns the number of verified entries.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvariantViolation`] at the first broken
    /// sequence number, previous link, or entry digest.
    pub fn verify_chain(&self, escrow_id: EscrowId) -> Result<u64, EscrowError> {
        let Some(log) = self.logs.read().get(&escrow_id).cloned() else {
            return Ok(0);
        };
        let entries = log.read();
        let mut expected_previous = ContentDigest::ZERO;
        for (index, entry) in entries.iter().enumerate() {
            let broken = |what: &str| EscrowError::InvariantViolation {
                escrow_id,
                detail: format!("audit chain broken at sequence {}: {what}", index + 1),
            };
            if entry.sequence != index as u64 + 1 {
                return Err(broken("sequence gap"));
            }
            if entry.previous_digest != expected_previous {
                return Err(broken("previous digest mismatch"));
            }
            if entry.compute_digest()? != entry.entry_digest {
                return Err(broken("entry digest mismatch"));
            }
            expected_previous = entry.entry_digest;
        }
        Ok(entries.len() as u64)
    }

    fn log_for(&self, escrow_id: EscrowId) -> EscrowLog {
        if let Some(log) = self.logs.read().get(&escrow_id) {
            return Arc::clone(log);
        }
        Arc::clone(self.logs.write().entry(escrow_id).or_default())
    }
}

/// A bounded, restartable view over one escrow's log.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    log: Option<EscrowLog>,
    start: usize,
    upto: usize,
}

impl AuditQuery {
    /// Iterate from the query's starting sequence. Each call restarts.
    pub fn iter(&self) -> AuditIter<'_> {
        AuditIter {
            query: self,
            next: self.start,
        }
    }

    /// Number of entries the query covers.
    pub fn len(&self) -> usize {
        self.upto.saturating_sub(self.start)
    }

    /// Whether the query covers no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a> IntoIterator for &'a AuditQuery {
    type Item = AuditEntry;
    type IntoIter = AuditIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over an [`AuditQuery`]; reads one entry per step.
#[derive(Debug)]
pub struct AuditIter<'a> {
    query: &'a AuditQuery,
    next: usize,
}

impl Iterator for AuditIter<'_> {
    type Item = AuditEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.query.upto {
            return None;
        }
        let entry = self.query.log.as_ref()?.read().get(self.next).cloned();
        self.next += 1;
        entry
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.query.upto.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(escrow_id: EscrowId, kind: AuditKind) -> AuditRecord {
        let after = escrow_core::sha256_digest(&CanonicalBytes::new(&kind).unwrap());
        AuditRecord {
            escrow_id,
            actor: ActorId::new("alice").unwrap(),
            kind,
            before: None,
            after,
            timestamp: Timestamp::now(),
        }
    }

    fn funded(total: i64) -> AuditKind {
        AuditKind::EscrowFunded {
            total_amount: MinorUnits::new(total),
        }
    }

    #[test]
    fn sequences_start_at_one_and_chain_from_zero() {
        let trail = AuditTrail::new();
        let id = EscrowId::new();
        let first = trail.append(record(id, AuditKind::EscrowClosed)).unwrap();
        let second = trail.append(record(id, funded(10))).unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.previous_digest, ContentDigest::ZERO);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.previous_digest, first.entry_digest);
        assert_eq!(trail.len(id), 2);
        assert_eq!(trail.verify_chain(id).unwrap(), 2);
    }

    #[test]
    fn staged_entries_are_invisible_until_committed() {
        let trail = AuditTrail::new();
        let id = EscrowId::new();
        trail.append(record(id, funded(1))).unwrap();

        let staged = trail.stage(vec![record(id, funded(2)), record(id, funded(3))]).unwrap();
        assert_eq!(staged.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(staged[1].previous_digest, staged[0].entry_digest);
        assert_eq!(trail.len(id), 1);

        // Abandoned staging leaves the log as it was.
        drop(staged);
        let staged = trail.stage(vec![record(id, funded(4))]).unwrap();
        assert_eq!(staged[0].sequence, 2);
        trail.commit(staged);
        assert_eq!(trail.len(id), 2);
        assert_eq!(trail.verify_chain(id).unwrap(), 2);
    }

    #[test]
    fn staging_refuses_mixed_escrows() {
        let trail = AuditTrail::new();
        let err = trail
            .stage(vec![record(EscrowId::new(), funded(1)), record(EscrowId::new(), funded(2))])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn logs_are_independent_per_escrow() {
        let trail = AuditTrail::new();
        let a = EscrowId::new();
        let b = EscrowId::new();
        trail.append(record(a, funded(1))).unwrap();
        trail.append(record(a, funded(2))).unwrap();
        let first_b = trail.append(record(b, funded(3))).unwrap();
        assert_eq!(first_b.sequence, 1);
        assert_eq!(trail.len(a), 2);
        assert_eq!(trail.len(EscrowId::new()), 0);
        assert_eq!(trail.verify_chain(EscrowId::new()).unwrap(), 0);
    }

    #[test]
    fn query_from_seq_is_ordered_and_restartable() {
        let trail = AuditTrail::new();
        let id = EscrowId::new();
        for n in 1..=5 {
            trail.append(record(id, funded(n))).unwrap();
        }
        let q = trail.query(id, 3);
        assert_eq!(q.len(), 3);
        let seqs: Vec<u64> = q.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        let again: Vec<u64> = (&q).into_iter().map(|e| e.sequence).collect();
        assert_eq!(again, seqs);

        // entries appended after the query are outside its bound
        trail.append(record(id, funded(6))).unwrap();
        assert_eq!(q.iter().count(), 3);
        assert_eq!(trail.query(id, 0).len(), 6);
        assert!(trail.query(id, 7).is_empty());
        assert!(trail.query(EscrowId::new(), 1).is_empty());
    }

    #[test]
    fn entry_lookup() {
        let trail = AuditTrail::new();
        let id = EscrowId::new();
        trail.append(record(id, funded(1))).unwrap();
        assert_eq!(trail.entry(id, 1).unwrap().sequence, 1);
        assert!(trail.entry(id, 0).is_none());
        assert!(trail.entry(id, 2).is_none());
    }

    #[test]
    fn tampered_entry_breaks_chain() {
        let trail = AuditTrail::new();
        let id = EscrowId::new();
        for n in 1..=3 {
            trail.append(record(id, funded(n))).unwrap();
        }
        {
            let log = trail.log_for(id);
            let mut entries = log.write();
            entries[1].kind = funded(999);
        }
        let err = trail.verify_chain(id).unwrap_err();
        assert!(err.is_fatal());
        assert!(format!("{err}").contains("sequence 2"));
    }

    #[test]
    fn relinked_entry_breaks_chain() {
        let trail = AuditTrail::new();
        let id = EscrowId::new();
        for n in 1..=3 {
            trail.append(record(id, funded(n))).unwrap();
        }
        {
            let log = trail.log_for(id);
            let mut entries = log.write();
            entries[2].previous_digest = ContentDigest::ZERO;
        }
        assert!(format!("{}", trail.verify_chain(id).unwrap_err()).contains("previous digest"));
    }

    #[test]
    fn kind_serializes_with_type_tag() {
        let v = serde_json::to_value(funded(5)).unwrap();
        assert_eq!(v["type"], "ESCROW_FUNDED");
        assert_eq!(v["total_amount"], 5);
        let closed = serde_json::to_value(AuditKind::EscrowClosed).unwrap();
        assert_eq!(closed["type"], "ESCROW_CLOSED");
        assert_eq!(AuditKind::EscrowClosed.to_string(), "ESCROW_CLOSED");
    }
}
