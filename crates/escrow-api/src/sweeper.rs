//! # Request Expiry Sweeper
//!
//! Background task that periodically expires fund requests older than the
//! configured TTL. Expiry is committed by the system actor, so it is
//! serialized with every other command on the escrow and audited like one.

use std::sync::Arc;
use std::time::Duration;

use escrow_core::Timestamp;
use escrow_workflow::EscrowService;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Spawn the sweeper on the current runtime.
    ///
    /// Returns `None` when the service has no request TTL configured.
    pub fn spawn(service: Arc<EscrowService>, interval: Duration) -> Option<Self> {
        if service.config().request_ttl.is_none() {
            return None;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        sweep_once(&service, Timestamp::now());
                    }
                }
            }
            tracing::debug!("expiry sweeper stopped");
        });
        tracing::info!(interval_secs = interval.as_secs(), "expiry sweeper started");
        Some(Self { shutdown, task })
    }

    /// Signal the sweeper to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "expiry sweeper terminated abnormally");
        }
    }
}

/// Run one sweep at `now`. Returns the number of requests expired.
pub fn sweep_once(service: &EscrowService, now: Timestamp) -> usize {
    let expired = service.expire_stale_requests(now);
    if !expired.is_empty() {
        tracing::info!(count = expired.len(), "expired stale fund requests");
    }
    expired.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use escrow_core::ActorId;
    use escrow_workflow::{CreateEscrow, NewFundRequest, Participant, RequestState, WorkflowConfig};

    fn service_with_ttl(ttl: Option<chrono::Duration>) -> Arc<EscrowService> {
        Arc::new(EscrowService::new(WorkflowConfig {
            request_ttl: ttl,
            ..WorkflowConfig::default()
        }))
    }

    fn open_request(service: &EscrowService) -> escrow_core::EscrowId {
        let alice = ActorId::new("alice").unwrap();
        let bob = ActorId::new("bob").unwrap();
        let escrow = service
            .create_escrow(
                &alice,
                CreateEscrow {
                    title: "Lease deposit".into(),
                    custodian_name: "Alice".into(),
                    currency: "EUR".into(),
                    stakeholders: vec![Participant::new(bob.clone(), "Bob").unwrap()],
                },
            )
            .unwrap();
        service.fund(escrow.id(), &alice, 5_000, None).unwrap();
        service
            .create_fund_request(
                escrow.id(),
                &bob,
                NewFundRequest {
                    amount: 1_000,
                    reason: "Repairs".into(),
                    description: String::new(),
                    document_refs: vec![],
                },
                None,
            )
            .unwrap();
        escrow.id()
    }

    #[test]
    fn sweep_expires_only_stale_requests() {
        let service = service_with_ttl(Some(chrono::Duration::hours(1)));
        let id = open_request(&service);

        assert_eq!(sweep_once(&service, Timestamp::now()), 0);

        let later = Timestamp::from_datetime(chrono::Utc::now() + chrono::Duration::hours(2));
        assert_eq!(sweep_once(&service, later), 1);
        let escrow = service.get_escrow_state(id).unwrap();
        assert_eq!(escrow.fund_requests()[0].state(), RequestState::Cancelled);

        assert_eq!(sweep_once(&service, later), 0);
    }

    #[tokio::test]
    async fn no_ttl_means_no_sweeper() {
        let service = service_with_ttl(None);
        assert!(ExpirySweeper::spawn(service, Duration::from_secs(1)).is_none());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let service = service_with_ttl(Some(chrono::Duration::hours(1)));
        let sweeper = ExpirySweeper::spawn(service, Duration::from_millis(10)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        sweeper.shutdown().await;
    }
}
