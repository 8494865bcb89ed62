//! # Escrow Store
//!
//! Persistence and the per-escrow critical section.
//!
//! [`EscrowStore::execute`] runs one mutating command:
//!
//! 1. take the escrow's command lock (commands on other escrows proceed);
//! 2. load the committed escrow and check the caller's expected version;
//! 3. clone it into a working copy and run the command on the copy;
//! 4. verify every aggregate invariant on the result;
//! 5. stage its snapshots and chained audit entries;
//! 6. save the new version, then publish the staged snapshots and entries.
//!
//! Everything that can fail happens before the save, and nothing becomes
//! visible until the save succeeds. A command that fails at any step leaves
//! the committed escrow, the audit trail and the snapshot store untouched.
//!
//! Command locks exist only for escrows that exist, so commands against
//! unknown identifiers allocate nothing. A command that records no transition (an
//! idempotent replay) commits nothing and does not bump the version.
//!
//! Queries read committed escrows from the repository and never take a
//! command lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use escrow_core::{EscrowId, Timestamp};

use crate::audit::{AuditEntry, AuditRecord, AuditTrail, Recorder};
use crate::error::{EscrowError, StateConflict};
use crate::escrow::Escrow;
use crate::snapshot::{PreparedSnapshot, SnapshotStore};

/// Storage of committed escrows.
///
/// `save` is a compare-and-swap on the escrow version.
pub trait EscrowRepository: Send + Sync {
    /// Store a new escrow. Fails if the identifier is taken.
    fn insert(&self, escrow: Escrow) -> Result<Arc<Escrow>, EscrowError>;

    /// The committed escrow.
    fn get(&self, escrow_id: EscrowId) -> Option<Arc<Escrow>>;

    /// Replace the committed escrow if it is still at `expected_version`.
    fn save(&self, escrow: Escrow, expected_version: u64) -> Result<Arc<Escrow>, EscrowError>;

    /// Every committed escrow, oldest first.
    fn list(&self) -> Vec<Arc<Escrow>>;
}

/// In-memory [`EscrowRepository`].
///
/// Holds committed escrows behind `Arc`s, so readers clone a pointer under
/// a short read lock and never observe a half-written escrow.
#[derive(Debug, Default)]
pub struct InMemoryEscrowRepository {
    data: RwLock<HashMap<EscrowId, Arc<Escrow>>>,
}

impl InMemoryEscrowRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EscrowRepository for InMemoryEscrowRepository {
    fn insert(&self, escrow: Escrow) -> Result<Arc<Escrow>, EscrowError> {
        let mut data = self.data.write();
        let id = escrow.id();
        if data.contains_key(&id) {
            return Err(EscrowError::InvariantViolation {
                escrow_id: id,
                detail: "escrow identifier already in use".to_string(),
            });
        }
        let stored = Arc::new(escrow);
        data.insert(id, Arc::clone(&stored));
        Ok(stored)
    }

    fn get(&self, escrow_id: EscrowId) -> Option<Arc<Escrow>> {
        self.data.read().get(&escrow_id).cloned()
    }

    fn save(&self, escrow: Escrow, expected_version: u64) -> Result<Arc<Escrow>, EscrowError> {
        let mut data = self.data.write();
        let id = escrow.id();
        let current = data.get(&id).ok_or(EscrowError::EscrowNotFound(id))?;
        if current.version() != expected_version {
            return Err(StateConflict::VersionMismatch {
                escrow_id: id,
                expected: expected_version,
                actual: current.version(),
            }
            .into());
        }
        let stored = Arc::new(escrow);
        data.insert(id, Arc::clone(&stored));
        Ok(stored)
    }

    fn list(&self) -> Vec<Arc<Escrow>> {
        let mut all: Vec<Arc<Escrow>> = self.data.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(&b.id())));
        all
    }
}

/// Result of a committed command.
#[derive(Debug, Clone)]
pub struct Committed<R> {
    /// The escrow after the command.
    pub escrow: Arc<Escrow>,
    /// Audit entries appended by the command, in order.
    pub entries: Vec<AuditEntry>,
    /// The command's own return value.
    pub value: R,
}

/// Per-escrow command serialization over a repository, audit trail and
/// snapshot store.
pub struct EscrowStore {
    repository: Arc<dyn EscrowRepository>,
    audit: Arc<AuditTrail>,
    snapshots: Arc<SnapshotStore>,
    locks: Mutex<HashMap<EscrowId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for EscrowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowStore")
            .field("escrows", &self.repository.list().len())
            .field("locks", &self.locks.lock().len())
            .finish()
    }
}

impl EscrowStore {
    /// Build a store over the given collaborators.
    pub fn new(
        repository: Arc<dyn EscrowRepository>,
        audit: Arc<AuditTrail>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            repository,
            audit,
            snapshots,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The committed escrow.
    pub fn get(&self, escrow_id: EscrowId) -> Result<Arc<Escrow>, EscrowError> {
        self.repository
            .get(escrow_id)
            .ok_or(EscrowError::EscrowNotFound(escrow_id))
    }

    /// Every committed escrow.
    pub fn list(&self) -> Vec<Arc<Escrow>> {
        self.repository.list()
    }

    /// The audit trail.
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// The snapshot store.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Commit a freshly created escrow with its creation transition.
    pub fn create(&self, mut escrow: Escrow, rec: Recorder) -> Result<Committed<()>, EscrowError> {
        let escrow_id = escrow.id();
        let lock = self.lock_for(escrow_id);
        let _guard = lock.lock();

        escrow.version = 1;
        let result = escrow
            .verify_invariants()
            .and_then(|()| self.stage_transitions(&escrow, None, rec.into_transitions()))
            .and_then(|staged| {
                let stored = self.repository.insert(escrow)?;
                Ok(Committed {
                    escrow: stored,
                    entries: self.publish(staged),
                    value: (),
                })
            });
        if result.is_err() && self.repository.get(escrow_id).is_none() {
            self.locks.lock().remove(&escrow_id);
        }
        result.map_err(|e| raise_alert(escrow_id, e))
    }

    /// Run a mutating command inside the escrow's critical section.
    ///
    /// # Errors
    ///
    /// [`EscrowError::EscrowNotFound`] for an unknown escrow,
    /// [`StateConflict::VersionMismatch`] when `expected_version` is stale,
    /// the command's own error, or [`EscrowError::InvariantViolation`] when
    /// the result breaks an aggregate invariant.
    pub fn execute<R>(
        &self,
        escrow_id: EscrowId,
        expected_version: Option<u64>,
        now: Timestamp,
        command: impl FnOnce(&mut Escrow, &mut Recorder) -> Result<R, EscrowError>,
    ) -> Result<Committed<R>, EscrowError> {
        self.get(escrow_id)?;
        let lock = self.lock_for(escrow_id);
        let _guard = lock.lock();
        self.execute_locked(escrow_id, expected_version, now, command)
            .map_err(|e| raise_alert(escrow_id, e))
    }

    fn execute_locked<R>(
        &self,
        escrow_id: EscrowId,
        expected_version: Option<u64>,
        now: Timestamp,
        command: impl FnOnce(&mut Escrow, &mut Recorder) -> Result<R, EscrowError>,
    ) -> Result<Committed<R>, EscrowError> {
        let current = self.get(escrow_id)?;
        if let Some(expected) = expected_version {
            if expected != current.version() {
                return Err(StateConflict::VersionMismatch {
                    escrow_id,
                    expected,
                    actual: current.version(),
                }
                .into());
            }
        }
        current.verify_invariants()?;

        let mut working = (*current).clone();
        working.version = current.version() + 1;
        working.updated_at = now;
        let mut rec = Recorder::default();
        let value = command(&mut working, &mut rec)?;

        if rec.is_empty() {
            return Ok(Committed {
                escrow: current,
                entries: Vec::new(),
                value,
            });
        }

        working.verify_invariants()?;
        let staged = self.stage_transitions(&working, Some(&current), rec.into_transitions())?;
        let stored = self.repository.save(working, current.version())?;
        let entries = self.publish(staged);
        Ok(Committed {
            escrow: stored,
            entries,
            value,
        })
    }

    fn stage_transitions(
        &self,
        committed: &Escrow,
        before: Option<&Escrow>,
        transitions: Vec<crate::audit::Transition>,
    ) -> Result<Staged, EscrowError> {
        let mut snapshots = Vec::with_capacity(transitions.len() + 1);
        let mut previous = match before {
            Some(b) => {
                let snapshot = SnapshotStore::prepare(b)?;
                let digest = snapshot.digest();
                snapshots.push(snapshot);
                Some(digest)
            }
            None => None,
        };
        let count = transitions.len();
        let mut records = Vec::with_capacity(count);
        for (i, t) in transitions.into_iter().enumerate() {
            // The last entry points at exactly what is committed; earlier
            // ones carry the committed version.
            let snapshot = if i + 1 == count {
                SnapshotStore::prepare(committed)?
            } else {
                let mut intermediate = t.snapshot;
                intermediate.version = committed.version();
                SnapshotStore::prepare(&intermediate)?
            };
            let after = snapshot.digest();
            snapshots.push(snapshot);
            records.push(AuditRecord {
                escrow_id: committed.id(),
                actor: t.actor,
                kind: t.kind,
                before: previous,
                after,
                timestamp: t.at,
            });
            previous = Some(after);
        }
        let entries = self.audit.stage(records)?;
        Ok(Staged { snapshots, entries })
    }

    fn publish(&self, staged: Staged) -> Vec<AuditEntry> {
        for snapshot in staged.snapshots {
            self.snapshots.insert(snapshot);
        }
        self.audit.commit(staged.entries.clone());
        staged.entries
    }

    fn lock_for(&self, escrow_id: EscrowId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(escrow_id).or_default())
    }
}

/// Snapshots and audit entries of one command, not yet visible.
struct Staged {
    snapshots: Vec<PreparedSnapshot>,
    entries: Vec<AuditEntry>,
}

fn raise_alert(escrow_id: EscrowId, error: EscrowError) -> EscrowError {
    if error.is_fatal() {
        tracing::error!(target: "escrow::alert", %escrow_id, error = %error, "invariant violation; command aborted");
        metrics::counter!("escrow_invariant_violations_total").increment(1);
    }
    error
}
