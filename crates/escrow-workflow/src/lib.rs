//! # escrow-workflow: Fund-Release Authorization Engine
//!
//! Governs how money held in an escrow account may be released:
//!
//! - **Ledger** ([`ledger`]): the funded, released and remaining amounts
//!   of one escrow, and the identity `total = released + remaining`.
//!
//! - **Conditions** ([`conditions`]): release conditions that must be met
//!   before an approved request may release funds.
//!
//! - **Lifecycle** ([`lifecycle`]): the fund request state machine
//!   `CREATED → UNDER_REVIEW → {APPROVED | REJECTED}`, cancellation, expiry
//!   and idempotent finalization.
//!
//! - **Review** ([`review`]): the reviewer roster snapshotted at request
//!   creation and the unanimity aggregation rule.
//!
//! - **Audit** ([`audit`], [`snapshot`]): an append-only, hash-chained log
//!   of every committed transition with content-addressed before/after
//!   snapshots.
//!
//! - **Store** ([`store`]): per-escrow serialization of mutating commands,
//!   optimistic version checks and all-or-nothing commits.
//!
//! - **Service** ([`service`]): the command and query surface used by the
//!   HTTP layer and by tests.
//!
//! - **Dispatch** ([`dispatch`]): post-commit notifications and payment
//!   instructions, delivered off the critical path with retry.
//!
//! ## Concurrency Model
//!
//! Mutating commands against one escrow are serialized by a per-escrow
//! lock. Commands against different escrows run in parallel. Queries read
//! the last committed snapshot and never wait on a command in flight.

pub mod audit;
pub mod conditions;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod escrow;
pub mod ledger;
pub mod lifecycle;
pub mod review;
pub mod service;
pub mod snapshot;
pub mod store;

pub use audit::{AuditEntry, AuditKind, AuditQuery, AuditTrail};
pub use conditions::{Condition, ConditionStatus, ConditionTracker};
pub use config::{ConfigError, RetryPolicy, WorkflowConfig};
pub use dispatch::{
    DeliveryError, DispatchHandle, Dispatcher, EscrowEvent, LoggingRail, NotificationSink,
    PaymentRail, ReleaseInstruction, TracingSink,
};
pub use error::{EscrowError, StateConflict};
pub use escrow::{Escrow, EscrowState, Participant};
pub use ledger::EscrowLedger;
pub use lifecycle::{CancellationCause, FundRequest, NewFundRequest, RequestState};
pub use review::{Decision, Review, ReviewCoordinator, ReviewerRoster};
pub use service::{CreateEscrow, EscrowService};
pub use snapshot::{PreparedSnapshot, SnapshotStore};
pub use store::{Committed, EscrowRepository, EscrowStore, InMemoryEscrowRepository};
