//! # Post-Commit Dispatch
//!
//! Committed transitions are turned into [`EscrowEvent`]s and, for
//! approvals, [`ReleaseInstruction`]s. Both are handed to a background task
//! and delivered to the [`NotificationSink`] and [`PaymentRail`]
//! collaborators with exponential backoff.
//!
//! Events travel over a bounded channel: a full channel drops the event and
//! counts it. Release instructions travel over their own unbounded channel
//! and are never dropped. The task drains pending releases before pending
//! events.
//!
//! Collaborator traits are synchronous. Each call runs on the blocking
//! thread pool.
//!
//! Nothing here can fail or roll back a command.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use escrow_core::{ActorId, CurrencyCode, EscrowId, FundRequestId, MinorUnits, Timestamp};

use crate::audit::{AuditEntry, AuditKind};
use crate::config::{RetryPolicy, WorkflowConfig};

/// Notification about one committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowEvent {
    /// The escrow.
    pub escrow_id: EscrowId,
    /// Audit sequence of the transition.
    pub sequence: u64,
    /// Escrow version after the command.
    pub version: u64,
    /// Who caused it.
    pub actor: ActorId,
    /// What happened.
    pub kind: AuditKind,
    /// When it happened.
    pub occurred_at: Timestamp,
}

impl EscrowEvent {
    /// Build the event for a committed audit entry.
    pub fn from_entry(entry: &AuditEntry, version: u64) -> Self {
        Self {
            escrow_id: entry.escrow_id,
            sequence: entry.sequence,
            version,
            actor: entry.actor.clone(),
            kind: entry.kind.clone(),
            occurred_at: entry.timestamp,
        }
    }
}

/// Instruction to move approved funds out of the escrow account.
///
/// `request_id` identifies the release uniquely; rails must treat a repeated
/// instruction for the same request as a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInstruction {
    /// The escrow.
    pub escrow_id: EscrowId,
    /// The approved request.
    pub request_id: FundRequestId,
    /// Released amount.
    pub amount: MinorUnits,
    /// Ledger currency.
    pub currency: CurrencyCode,
    /// Who raised the request.
    pub requested_by: ActorId,
}

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Temporarily unreachable; worth retrying.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    /// Refused the payload.
    #[error("collaborator rejected delivery: {0}")]
    Rejected(String),
}

/// Receives notifications about committed transitions.
pub trait NotificationSink: Send + Sync + 'static {
    /// Deliver one event.
    fn deliver(&self, event: &EscrowEvent) -> Result<(), DeliveryError>;
}

/// Executes approved releases against the payment system.
pub trait PaymentRail: Send + Sync + 'static {
    /// Execute one release.
    fn execute(&self, instruction: &ReleaseInstruction) -> Result<(), DeliveryError>;
}

/// Sink that writes events to the structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, event: &EscrowEvent) -> Result<(), DeliveryError> {
        tracing::info!(
            target: "escrow::events",
            escrow_id = %event.escrow_id,
            sequence = event.sequence,
            version = event.version,
            actor = %event.actor,
            kind = %event.kind,
            "escrow event"
        );
        Ok(())
    }
}

/// Rail that logs instructions without moving money.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingRail;

impl PaymentRail for LoggingRail {
    fn execute(&self, instruction: &ReleaseInstruction) -> Result<(), DeliveryError> {
        tracing::info!(
            target: "escrow::payments",
            escrow_id = %instruction.escrow_id,
            request_id = %instruction.request_id,
            amount = %instruction.amount,
            currency = %instruction.currency,
            "release instruction"
        );
        Ok(())
    }
}

/// Sending half of the dispatcher. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    events: mpsc::Sender<EscrowEvent>,
    releases: mpsc::UnboundedSender<ReleaseInstruction>,
}

impl DispatchHandle {
    /// Queue an event. Never blocks; drops the event when the queue is full.
    pub fn notify(&self, event: EscrowEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::error!(channel = "notification", error = %e, "dispatch queue unavailable; event dropped");
            metrics::counter!("escrow_notifications_failed_total", "channel" => "notification", "reason" => "dropped")
                .increment(1);
        }
    }

    /// Queue a release instruction. Never blocks and never drops while the
    /// dispatcher is running.
    pub fn release(&self, instruction: ReleaseInstruction) {
        if let Err(e) = self.releases.send(instruction) {
            tracing::error!(
                target: "escrow::alert",
                escrow_id = %e.0.escrow_id,
                request_id = %e.0.request_id,
                amount = %e.0.amount,
                "dispatcher stopped; release instruction not delivered"
            );
            metrics::counter!("escrow_notifications_failed_total", "channel" => "payment", "reason" => "dropped")
                .increment(1);
        }
    }
}

/// Background delivery task.
#[derive(Debug)]
pub struct Dispatcher;

impl Dispatcher {
    /// Spawn the delivery task on the current tokio runtime.
    ///
    /// The task ends once every [`DispatchHandle`] is dropped and both
    /// queues are drained.
    pub fn spawn(
        config: &WorkflowConfig,
        sink: Arc<dyn NotificationSink>,
        rail: Arc<dyn PaymentRail>,
    ) -> (DispatchHandle, JoinHandle<()>) {
        let (events, events_rx) = mpsc::channel(config.dispatch_buffer.max(1));
        let (releases, releases_rx) = mpsc::unbounded_channel();
        let policy = config.notification_retry;
        let task = tokio::spawn(run(events_rx, releases_rx, policy, sink, rail));
        (DispatchHandle { events, releases }, task)
    }
}

async fn run(
    mut events: mpsc::Receiver<EscrowEvent>,
    mut releases: mpsc::UnboundedReceiver<ReleaseInstruction>,
    policy: RetryPolicy,
    sink: Arc<dyn NotificationSink>,
    rail: Arc<dyn PaymentRail>,
) {
    loop {
        tokio::select! {
            biased;
            Some(instruction) = releases.recv() => {
                let rail = Arc::clone(&rail);
                let instruction = Arc::new(instruction);
                deliver_with_retry("payment", policy, move || rail.execute(&instruction)).await;
            }
            Some(event) = events.recv() => {
                let sink = Arc::clone(&sink);
                let event = Arc::new(event);
                deliver_with_retry("notification", policy, move || sink.deliver(&event)).await;
            }
            else => break,
        }
    }
    tracing::debug!("dispatcher stopped");
}

async fn deliver_with_retry<F>(channel: &'static str, policy: RetryPolicy, attempt: F) -> bool
where
    F: Fn() -> Result<(), DeliveryError> + Clone + Send + 'static,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    for n in 1..=max_attempts {
        let delay = policy.backoff(n);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let outcome = tokio::task::spawn_blocking(attempt.clone())
            .await
            .unwrap_or_else(|e| Err(DeliveryError::Rejected(format!("collaborator panicked: {e}"))));
        match outcome {
            Ok(()) => {
                metrics::counter!("escrow_notifications_delivered_total", "channel" => channel).increment(1);
                return true;
            }
            Err(DeliveryError::Rejected(reason)) => {
                last_error = Some(DeliveryError::Rejected(reason));
                break;
            }
            Err(e) => {
                tracing::warn!(channel, attempt = n, max_attempts, error = %e, "delivery failed; will retry");
                last_error = Some(e);
            }
        }
    }
    if let Some(e) = last_error {
        tracing::error!(channel, error = %e, "delivery abandoned");
    }
    metrics::counter!("escrow_notifications_failed_total", "channel" => channel, "reason" => "exhausted")
        .increment(1);
    false
}
