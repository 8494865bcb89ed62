//! # Release Conditions
//!
//! Conditions that must be MET before an approved fund request may release
//! funds. Only conditions flagged `required` gate a release; optional
//! conditions are tracked for the record.
//!
//! Conditions are evaluated at decision time, not at request creation. A
//! condition that is met after every reviewer approved does not release
//! funds on its own; the request is re-evaluated explicitly.

use serde::{Deserialize, Serialize};

use escrow_core::error::validate_text;
use escrow_core::{ActorId, ConditionId, DocumentRef, EscrowId, Timestamp};

use crate::error::EscrowError;

/// Maximum length of a condition description.
const MAX_DESCRIPTION_LEN: usize = 500;

/// Whether a condition has been satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionStatus {
    /// Not yet satisfied.
    Pending,
    /// Satisfied, with evidence on record.
    Met,
}

impl ConditionStatus {
    /// The canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Met => "MET",
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A release condition attached to an escrow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition identifier.
    pub id: ConditionId,
    /// What must happen for the condition to be met.
    pub description: String,
    /// Whether the condition gates fund releases.
    pub required: bool,
    /// Current status.
    pub status: ConditionStatus,
    /// Document supporting the MET status.
    pub evidence_ref: Option<DocumentRef>,
    /// Who marked the condition met.
    pub met_by: Option<ActorId>,
    /// When the condition was marked met.
    pub met_at: Option<Timestamp>,
    /// When the condition was added.
    pub created_at: Timestamp,
}

/// The set of conditions attached to one escrow, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionTracker(Vec<Condition>);

impl ConditionTracker {
    /// An empty condition set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new PENDING condition.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::Validation`] for an empty or oversized
    /// description.
    pub fn add(&mut self, description: &str, required: bool, now: Timestamp) -> Result<ConditionId, EscrowError> {
        let description = validate_text("description", description, MAX_DESCRIPTION_LEN)?;
        let id = ConditionId::new();
        self.0.push(Condition {
            id,
            description,
            required,
            status: ConditionStatus::Pending,
            evidence_ref: None,
            met_by: None,
            met_at: None,
            created_at: now,
        });
        Ok(id)
    }

    /// Mark a condition MET with supporting evidence.
    ///
    /// Returns `false` if the condition was already MET (nothing changes).
    pub fn mark_met(
        &mut self,
        escrow_id: EscrowId,
        condition_id: ConditionId,
        evidence_ref: DocumentRef,
        actor: &ActorId,
        now: Timestamp,
    ) -> Result<bool, EscrowError> {
        let condition = self.find_mut(escrow_id, condition_id)?;
        if condition.status == ConditionStatus::Met {
            return Ok(false);
        }
        condition.status = ConditionStatus::Met;
        condition.evidence_ref = Some(evidence_ref);
        condition.met_by = Some(actor.clone());
        condition.met_at = Some(now);
        Ok(true)
    }

    /// Revert a condition to PENDING, for example when its evidence is
    /// withdrawn.
    ///
    /// Returns `false` if the condition was already PENDING.
    pub fn mark_pending(&mut self, escrow_id: EscrowId, condition_id: ConditionId) -> Result<bool, EscrowError> {
        let condition = self.find_mut(escrow_id, condition_id)?;
        if condition.status == ConditionStatus::Pending {
            return Ok(false);
        }
        condition.status = ConditionStatus::Pending;
        condition.evidence_ref = None;
        condition.met_by = None;
        condition.met_at = None;
        Ok(true)
    }

    /// Whether every required condition is MET.
    pub fn required_satisfied(&self) -> bool {
        self.0
            .iter()
            .filter(|c| c.required)
            .all(|c| c.status == ConditionStatus::Met)
    }

    /// Required conditions still PENDING.
    pub fn pending_required(&self) -> Vec<ConditionId> {
        self.0
            .iter()
            .filter(|c| c.required && c.status == ConditionStatus::Pending)
            .map(|c| c.id)
            .collect()
    }

    /// Look up a condition.
    pub fn get(&self, condition_id: ConditionId) -> Option<&Condition> {
        self.0.iter().find(|c| c.id == condition_id)
    }

    /// Iterate conditions in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, Condition> {
        self.0.iter()
    }

    /// Number of conditions.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no conditions are attached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn find_mut(&mut self, escrow_id: EscrowId, condition_id: ConditionId) -> Result<&mut Condition, EscrowError> {
        self.0
            .iter_mut()
            .find(|c| c.id == condition_id)
            .ok_or(EscrowError::ConditionNotFound {
                escrow_id,
                condition_id,
            })
    }
}

impl<'a> IntoIterator for &'a ConditionTracker {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
