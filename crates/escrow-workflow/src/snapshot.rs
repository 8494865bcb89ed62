//! # Snapshot Store
//!
//! Content-addressed storage for escrow snapshots referenced by audit
//! entries. A snapshot is stored as its canonical JSON bytes under the
//! SHA-256 digest of those bytes.
//!
//! ## Integrity Invariant
//!
//! On retrieval the digest is recomputed and compared with the key.
//! Corruption or tampering is detected at read time.
//!
//! Canonical form truncates timestamps to whole seconds, so a reconstructed
//! escrow matches the live one up to sub-second precision.

use std::collections::HashMap;

use parking_lot::RwLock;

use escrow_core::{sha256_digest, CanonicalBytes, ContentDigest, EscrowId};

use crate::error::EscrowError;
use crate::escrow::Escrow;

/// Canonical bytes of an escrow and their digest, ready to store.
#[derive(Debug, Clone)]
pub struct PreparedSnapshot {
    digest: ContentDigest,
    bytes: Vec<u8>,
}

impl PreparedSnapshot {
    /// The digest the snapshot will be stored under.
    pub fn digest(&self) -> ContentDigest {
        self.digest
    }
}

/// Content-addressed escrow snapshots.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    blobs: RwLock<HashMap<ContentDigest, Vec<u8>>>,
}

impl SnapshotStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest an escrow without storing it.
    pub fn digest(escrow: &Escrow) -> Result<ContentDigest, EscrowError> {
        Ok(sha256_digest(&CanonicalBytes::new(escrow)?))
    }

    /// Encode a snapshot without storing it.
    pub fn prepare(escrow: &Escrow) -> Result<PreparedSnapshot, EscrowError> {
        let canonical = CanonicalBytes::new(escrow)?;
        Ok(PreparedSnapshot {
            digest: sha256_digest(&canonical),
            bytes: canonical.into_bytes(),
        })
    }

    /// Store a prepared snapshot and return its digest. Storing the same
    /// content twice is a no-op.
    pub fn insert(&self, snapshot: PreparedSnapshot) -> ContentDigest {
        let digest = snapshot.digest;
        self.blobs.write().entry(digest).or_insert(snapshot.bytes);
        digest
    }

    /// Encode and store a snapshot.
    pub fn put(&self, escrow: &Escrow) -> Result<ContentDigest, EscrowError> {
        Ok(self.insert(Self::prepare(escrow)?))
    }

    /// Whether a snapshot is stored under `digest`.
    pub fn contains(&self, digest: &ContentDigest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load and verify the snapshot stored under `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`EscrowError::InvariantViolation`] if the snapshot is
    /// missing, fails its integrity check, or does not decode.
    pub fn get(&self, escrow_id: EscrowId, digest: &ContentDigest) -> Result<Escrow, EscrowError> {
        let broken = |detail: String| EscrowError::InvariantViolation { escrow_id, detail };
        let bytes = self
            .blobs
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| broken(format!("snapshot {digest} is missing")))?;

        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| broken(format!("snapshot {digest} does not decode: {e}")))?;
        let actual = sha256_digest(&CanonicalBytes::new(&value)?);
        if actual != *digest {
            return Err(broken(format!(
                "snapshot integrity check failed: expected {digest}, got {actual}"
            )));
        }
        serde_json::from_value(value)
            .map_err(|e| broken(format!("snapshot {digest} does not decode: {e}")))
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self, digest: &ContentDigest, bytes: Vec<u8>) {
        self.blobs.write().insert(*digest, bytes);
    }
}
