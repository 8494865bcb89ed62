//! # Identifiers
//!
//! Newtype identifiers for escrow domain objects. Record identifiers wrap a
//! UUID v4; [`ActorId`] wraps the opaque user identifier handed to the core
//! by the external authentication service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of an escrow account.
    EscrowId,
    "escrow"
);

uuid_id!(
    /// Unique identifier of a fund request within an escrow.
    FundRequestId,
    "request"
);

uuid_id!(
    /// Unique identifier of a release condition within an escrow.
    ConditionId,
    "condition"
);

/// Maximum length of an actor identifier.
const MAX_ACTOR_LEN: usize = 128;

/// Identity of a resolved actor (custodian, stakeholder, or system).
///
/// The core never authenticates; it receives an already-resolved identity
/// from the authentication collaborator and only checks membership.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActorId(String);

impl ActorId {
    /// Identity recorded for transitions the engine performs on its own
    /// (request expiry).
    pub const SYSTEM: &'static str = "system";

    /// Create a validated actor identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ACTOR_LEN || id.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidActorId(id));
        }
        Ok(Self(id))
    }

    /// The system actor.
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    /// Whether this is the system actor.
    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }

    /// Access the identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActorId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ActorId> for String {
    fn from(id: ActorId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maximum length of a document reference.
const MAX_DOCUMENT_REF_LEN: usize = 512;

/// Opaque reference to a document held by the storage collaborator.
///
/// The core never reads document bytes; it only records which documents
/// support a fund request or satisfied a release condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentRef(String);

impl DocumentRef {
    /// Create a validated document reference.
    pub fn new(reference: impl Into<String>) -> Result<Self, ValidationError> {
        let reference = reference.into();
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::field("document_ref", "must not be empty"));
        }
        if trimmed.len() > MAX_DOCUMENT_REF_LEN {
            return Err(ValidationError::field(
                "document_ref",
                format!("must not exceed {MAX_DOCUMENT_REF_LEN} bytes"),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Access the reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DocumentRef {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DocumentRef> for String {
    fn from(r: DocumentRef) -> Self {
        r.0
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
