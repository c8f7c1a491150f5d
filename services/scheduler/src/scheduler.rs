//! Scheduler facade.
//!
//! The transport pushes every inbound event into one queue; [`ClusterScheduler::run`]
//! consumes it in arrival order and dispatches into the registry, the
//! launcher and the status reconciler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use seedkeeper_id::{FrameworkId, HostId, OfferId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::coordination::SessionIdentity;
use crate::driver::OfferDriver;
use crate::launcher::{LaunchRequest, LauncherHandle};
use crate::offers::{DeclineReason, Offer};
use crate::registry::MemberRegistry;
use crate::status::{StatusEvent, StatusReconciler};

/// Everything the cluster manager can tell the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Registered { framework_id: FrameworkId },
    Reregistered,
    Disconnected,
    Offers(Vec<Offer>),
    OfferRescinded(OfferId),
    Status(StatusEvent),
    AgentLost(HostId),
    Error(String),
}

impl SchedulerEvent {
    fn kind(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::Reregistered => "reregistered",
            Self::Disconnected => "disconnected",
            Self::Offers(_) => "offers",
            Self::OfferRescinded(_) => "offer_rescinded",
            Self::Status(_) => "status",
            Self::AgentLost(_) => "agent_lost",
            Self::Error(_) => "error",
        }
    }
}

/// Event-driven entry point.
pub struct ClusterScheduler {
    registry: Arc<MemberRegistry>,
    driver: Arc<dyn OfferDriver>,
    launcher: LauncherHandle,
    reconciler: Arc<StatusReconciler>,
    identity: SessionIdentity,
    connected: AtomicBool,
    shutting_down: AtomicBool,
}

impl ClusterScheduler {
    pub fn new(
        registry: Arc<MemberRegistry>,
        driver: Arc<dyn OfferDriver>,
        launcher: LauncherHandle,
        reconciler: Arc<StatusReconciler>,
        identity: SessionIdentity,
    ) -> Self {
        Self {
            registry,
            driver,
            launcher,
            reconciler,
            identity,
            connected: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Registered, connected and not shutting down.
    pub fn is_accepting(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.shutting_down.load(Ordering::SeqCst)
    }

    /// Decline every further offer.
    pub fn stop_accepting(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Consume events until shutdown, then drain what is already queued.
    #[instrument(skip(self, events, shutdown))]
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<SchedulerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Scheduler event loop started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_accepting();
        events.close();
        while let Ok(event) = events.try_recv() {
            self.handle(event).await;
        }
        info!("Scheduler event loop stopped");
    }

    /// Handle one event.
    pub async fn handle(&self, event: SchedulerEvent) {
        debug!(kind = event.kind(), "Handling event");
        match event {
            SchedulerEvent::Registered { framework_id } => {
                info!(framework_id = %framework_id, "Registered with cluster manager");
                if let Err(e) = self.identity.persist_framework_id(&framework_id).await {
                    error!(framework_id = %framework_id, error = %e, "Failed to persist framework ID");
                }
                self.connected.store(true, Ordering::SeqCst);
                self.reconcile_tasks().await;
            }
            SchedulerEvent::Reregistered => {
                info!("Re-registered with cluster manager");
                self.connected.store(true, Ordering::SeqCst);
                self.reconcile_tasks().await;
            }
            SchedulerEvent::Disconnected => {
                warn!("Disconnected from cluster manager, no longer accepting offers");
                self.connected.store(false, Ordering::SeqCst);
            }
            SchedulerEvent::Offers(offers) => self.handle_offers(offers).await,
            SchedulerEvent::OfferRescinded(offer_id) => {
                self.registry.offer_rescinded(&offer_id).await;
            }
            SchedulerEvent::Status(status) => {
                self.reconciler.apply(&status, Instant::now()).await;
            }
            SchedulerEvent::AgentLost(host) => {
                let affected = self.registry.agent_lost(&host, Instant::now()).await;
                warn!(host = %host, members = affected.len(), "Agent lost");
            }
            SchedulerEvent::Error(message) => {
                error!(error = %message, "Cluster manager reported an error");
                self.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn handle_offers(&self, offers: Vec<Offer>) {
        let decision = self
            .registry
            .match_offers(offers, self.launcher.is_busy(), self.is_accepting())
            .await;

        for declined in &decision.declined {
            debug!(
                offer_id = %declined.offer_id,
                host = %declined.host,
                reason = %declined.reason,
                "Declining offer"
            );
            self.decline(&declined.offer_id, declined.reason).await;
        }

        for planned in decision.launches {
            if let Err(request) = self.launcher.submit(LaunchRequest::from(planned)) {
                warn!(member_id = %request.member_id, "Launcher queue full, releasing offer");
                if let Err(e) = self.registry.rollback_launch(request.member_id).await {
                    warn!(member_id = %request.member_id, error = %e, "Rollback failed");
                }
                self.decline(&request.offer_id, DeclineReason::LaunchInFlight)
                    .await;
            }
        }
    }

    async fn reconcile_tasks(&self) {
        let tasks = self.registry.task_handles().await;
        debug!(tasks = tasks.len(), "Requesting task reconciliation");
        if let Err(e) = self.driver.reconcile(tasks).await {
            warn!(error = %e, "Task reconciliation request failed");
        }
    }

    async fn decline(&self, offer_id: &OfferId, reason: DeclineReason) {
        if let Err(e) = self.driver.decline(offer_id, reason.refuse_for()).await {
            warn!(offer_id = %offer_id, error = %e, "Failed to decline offer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationStore, MembershipCheckpoint, MemoryStore};
    use crate::driver::{DriverCall, MockDriver};
    use crate::launcher::{LaunchTemplate, SerialLauncher};
    use crate::offers::tests::offer;
    use crate::offers::MemberRequirements;
    use crate::registry::tests::registry;
    use std::time::Duration;

    struct Fixture {
        scheduler: ClusterScheduler,
        driver: Arc<MockDriver>,
        store: Arc<MemoryStore>,
        _launcher: SerialLauncher,
    }

    fn scheduler() -> Fixture {
        let reg = Arc::new(registry(3));
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(MemoryStore::new());
        let checkpoint = MembershipCheckpoint::new(store.clone(), "/sk", "t");
        let reconciler = Arc::new(StatusReconciler::new(
            reg.clone(),
            driver.clone(),
            checkpoint.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        // The launcher worker is not started; its queue holds one request.
        let (launcher, handle) = SerialLauncher::new(
            reg.clone(),
            driver.clone(),
            checkpoint,
            LaunchTemplate {
                cluster_name: "t".to_string(),
                requirements: MemberRequirements::default(),
                artifacts: vec![],
                convergence_delay: Duration::from_secs(1),
            },
        );
        let identity = SessionIdentity::new(store.clone(), "/sk", "t");
        let scheduler = ClusterScheduler::new(reg, driver.clone(), handle, reconciler, identity);
        Fixture {
            scheduler,
            driver,
            store,
            _launcher: launcher,
        }
    }

    #[tokio::test]
    async fn test_offers_declined_before_registration() {
        let fx = scheduler();
        let (s, driver) = (&fx.scheduler, &fx.driver);
        s.handle(SchedulerEvent::Offers(vec![offer("o1", "h1")])).await;
        assert_eq!(driver.declines(), vec![OfferId::new("o1")]);
    }

    #[tokio::test]
    async fn test_registration_persists_identity_and_reconciles() {
        let fx = scheduler();
        let (s, driver, store) = (&fx.scheduler, &fx.driver, &fx.store);
        s.handle(SchedulerEvent::Registered {
            framework_id: FrameworkId::new("fw-1"),
        })
        .await;

        assert!(s.is_accepting());
        assert_eq!(
            store.get("/sk/t/framework_id").await.unwrap().as_deref(),
            Some("fw-1")
        );
        assert!(driver
            .calls()
            .iter()
            .any(|c| matches!(c, DriverCall::Reconcile(tasks) if tasks.is_empty())));

        s.handle(SchedulerEvent::Disconnected).await;
        assert!(!s.is_accepting());
    }

    #[tokio::test]
    async fn test_accepted_offer_queued_for_launcher() {
        let fx = scheduler();
        let (s, driver) = (&fx.scheduler, &fx.driver);
        s.handle(SchedulerEvent::Reregistered).await;
        s.handle(SchedulerEvent::Offers(vec![offer("o1", "h1"), offer("o2", "h2")]))
            .await;

        // o1 waits in the launcher queue, o2 is declined
        assert_eq!(driver.declines(), vec![OfferId::new("o2")]);
        assert_eq!(s.registry.counts().await.requested, 1);

        s.stop_accepting();
        s.handle(SchedulerEvent::Offers(vec![offer("o3", "h3")])).await;
        assert_eq!(driver.declines().len(), 2);
    }
}
