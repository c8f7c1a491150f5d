//! Serial launcher.
//!
//! Launches members strictly one at a time. After each successful launch
//! the launcher sleeps through the convergence delay so the new member can
//! join and the existing members can catch up before the next one starts.
//! While it works or sleeps it reports `Busy`, which closes the matcher's
//! launch gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use seedkeeper_id::{Generation, MemberId, OfferId};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::coordination::MembershipCheckpoint;
use crate::driver::{LaunchSpec, OfferDriver};
use crate::offers::{DeclineReason, MemberRequirements};
use crate::registry::{MemberRegistry, PlannedLaunch};

/// Whether the launcher can take another request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherState {
    Idle,
    Busy,
}

/// One launch for the launcher to carry out.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub member_id: MemberId,
    pub generation: Generation,
    pub offer_id: OfferId,
    pub plan: PlannedLaunch,
}

impl From<PlannedLaunch> for LaunchRequest {
    fn from(plan: PlannedLaunch) -> Self {
        Self {
            member_id: plan.member_id,
            generation: plan.generation,
            offer_id: plan.offer.id.clone(),
            plan,
        }
    }
}

/// Sending side of the launcher, held by the scheduler facade.
#[derive(Clone)]
pub struct LauncherHandle {
    requests: mpsc::Sender<LaunchRequest>,
    state: watch::Receiver<LauncherState>,
}

impl LauncherHandle {
    pub fn is_busy(&self) -> bool {
        *self.state.borrow() == LauncherState::Busy
    }

    pub fn state(&self) -> watch::Receiver<LauncherState> {
        self.state.clone()
    }

    /// Queue a request without waiting. A full queue hands the request back.
    pub fn submit(&self, request: LaunchRequest) -> Result<(), LaunchRequest> {
        self.requests.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
        })
    }
}

/// Launch settings shared by every member.
#[derive(Debug, Clone)]
pub struct LaunchTemplate {
    pub cluster_name: String,
    pub requirements: MemberRequirements,
    pub artifacts: Vec<String>,
    pub convergence_delay: Duration,
}

/// Single-flight launch worker.
pub struct SerialLauncher {
    registry: Arc<MemberRegistry>,
    driver: Arc<dyn OfferDriver>,
    checkpoint: MembershipCheckpoint,
    template: LaunchTemplate,
    requests: mpsc::Receiver<LaunchRequest>,
    state: watch::Sender<LauncherState>,
    generation: watch::Receiver<Generation>,
}

impl SerialLauncher {
    pub fn new(
        registry: Arc<MemberRegistry>,
        driver: Arc<dyn OfferDriver>,
        checkpoint: MembershipCheckpoint,
        template: LaunchTemplate,
    ) -> (Self, LauncherHandle) {
        let (requests_tx, requests) = mpsc::channel(1);
        let (state, state_rx) = watch::channel(LauncherState::Idle);
        let generation = registry.subscribe_generation();
        let launcher = Self {
            registry,
            driver,
            checkpoint,
            template,
            requests,
            state,
            generation,
        };
        let handle = LauncherHandle {
            requests: requests_tx,
            state: state_rx,
        };
        (launcher, handle)
    }

    /// Process requests until shutdown.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            convergence_delay_secs = self.template.convergence_delay.as_secs(),
            "Starting serial launcher"
        );

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else { break };
                    self.process(request, &mut shutdown).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            info!(member_id = %request.member_id, "Abandoning queued launch on shutdown");
            if let Err(e) = self.registry.rollback_launch(request.member_id).await {
                warn!(member_id = %request.member_id, error = %e, "Rollback failed");
            }
            self.decline(&request.offer_id, DeclineReason::ShuttingDown)
                .await;
        }
        self.state.send_replace(LauncherState::Idle);
        info!("Serial launcher stopped");
    }

    async fn process(&mut self, request: LaunchRequest, shutdown: &mut watch::Receiver<bool>) {
        self.state.send_replace(LauncherState::Busy);
        self.generation.borrow_and_update();

        let launched = self.launch(&request).await;
        if launched {
            self.converge(shutdown).await;
        }

        self.state.send_replace(LauncherState::Idle);
    }

    async fn launch(&self, request: &LaunchRequest) -> bool {
        let ctx = match self
            .registry
            .begin_launch(request.member_id, request.generation, Instant::now())
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                info!(member_id = %request.member_id, error = %e, "Dropping launch request");
                self.decline(&request.offer_id, DeclineReason::LaunchInFlight)
                    .await;
                return false;
            }
        };

        let spec = LaunchSpec::new(
            &ctx,
            &self.template.cluster_name,
            &self.template.requirements,
            self.template.artifacts.clone(),
        );
        let task = spec.task;

        if let Err(e) = self.driver.launch(&request.plan.offer, spec).await {
            error!(member_id = %request.member_id, task = %task, error = %e, "Launch failed");
            if let Err(e) = self.registry.rollback_launch(request.member_id).await {
                warn!(member_id = %request.member_id, error = %e, "Rollback failed");
            }
            return false;
        }

        if !self.still_wanted(request).await {
            warn!(member_id = %request.member_id, task = %task, "Member removed during launch, killing task");
            if let Err(e) = self.driver.kill(task).await {
                warn!(task = %task, error = %e, "Failed to kill task");
            }
            return false;
        }

        info!(
            member_id = %request.member_id,
            task = %task,
            host = %ctx.member.host,
            role = ?ctx.member.role,
            "Launched member"
        );

        if let Err(e) = self.checkpoint.save_member(&ctx.member.to_record()).await {
            warn!(member_id = %request.member_id, error = %e, "Failed to checkpoint member");
        }

        // A reseed may have forgotten the member while the record was written.
        if !self.still_wanted(request).await {
            if let Err(e) = self.checkpoint.forget(request.member_id).await {
                warn!(member_id = %request.member_id, error = %e, "Failed to delete member checkpoint");
            }
            return false;
        }
        true
    }

    async fn still_wanted(&self, request: &LaunchRequest) -> bool {
        self.registry
            .launched(request.member_id, request.generation)
            .await
    }

    /// Sleep the convergence delay, cut short by a reseed or shutdown.
    async fn converge(&mut self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.template.convergence_delay) => {}
            _ = self.generation.changed() => {
                info!("Generation changed, ending convergence delay early");
            }
            _ = shutdown.changed() => {}
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
    use crate::coordination::{CoordinationStore, MemoryStore};
    use crate::driver::MockDriver;
    use crate::offers::tests::offer;
    use crate::registry::tests::registry;
    use crate::registry::MemberState;
    use seedkeeper_id::TaskHandle;

    fn template(delay: Duration) -> LaunchTemplate {
        LaunchTemplate {
            cluster_name: "test".to_string(),
            requirements: MemberRequirements::default(),
            artifacts: vec!["http://127.0.0.1:12300/etcd".to_string()],
            convergence_delay: delay,
        }
    }

    struct Harness {
        registry: Arc<MemberRegistry>,
        driver: Arc<MockDriver>,
        store: Arc<MemoryStore>,
        handle: LauncherHandle,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(driver: MockDriver, delay: Duration) -> Harness {
        let registry = Arc::new(registry(3));
        let driver = Arc::new(driver);
        let store = Arc::new(MemoryStore::new());
        let checkpoint = MembershipCheckpoint::new(store.clone(), "/sk", "test");
        let (launcher, handle) =
            SerialLauncher::new(registry.clone(), driver.clone(), checkpoint, template(delay));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(launcher.run(shutdown_rx));
        Harness {
            registry,
            driver,
            store,
            handle,
            shutdown,
            task,
        }
    }

    async fn wait_for(mut state: watch::Receiver<LauncherState>, want: LauncherState) {
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_launch_checkpoints_and_stays_busy() {
        let h = start(MockDriver::new(), Duration::from_secs(60));
        let decision = h
            .registry
            .match_offers(vec![offer("o1", "h1")], false, true)
            .await;
        let member_id = decision.launches[0].member_id;
        h.handle.submit(decision.launches[0].clone().into()).unwrap();

        wait_for(h.handle.state(), LauncherState::Busy).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.driver.launches().len(), 1);
        let member = h.registry.member(&member_id).await.unwrap();
        assert_eq!(member.state, MemberState::Launching);
        assert!(h.handle.is_busy());
        let path = format!("/sk/test/members/{member_id}");
        assert!(h.store.get(&path).await.unwrap().is_some());

        // A reseed ends the convergence delay
        h.registry.begin_reseed().await;
        wait_for(h.handle.state(), LauncherState::Idle).await;

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_launch_rolls_back() {
        let h = start(MockDriver::failing(), Duration::from_secs(60));
        let decision = h
            .registry
            .match_offers(vec![offer("o1", "h1")], false, true)
            .await;
        let member_id = decision.launches[0].member_id;
        h.handle.submit(decision.launches[0].clone().into()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            h.registry.member(&member_id).await.unwrap().state,
            MemberState::Failed
        );
        assert!(!h.handle.is_busy(), "no convergence delay after a failed launch");

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_request_declines_offer() {
        let h = start(MockDriver::new(), Duration::from_millis(10));
        let decision = h
            .registry
            .match_offers(vec![offer("o1", "h1")], false, true)
            .await;
        h.registry.begin_reseed().await;
        h.handle.submit(decision.launches[0].clone().into()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.driver.launches().is_empty());
        assert_eq!(h.driver.declines(), vec![OfferId::new("o1")]);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reseed_during_launch_leaves_no_checkpoint() {
        let h = start(
            MockDriver::with_launch_delay(Duration::from_millis(200)),
            Duration::from_secs(60),
        );
        let decision = h
            .registry
            .match_offers(vec![offer("o1", "h1")], false, true)
            .await;
        let member_id = decision.launches[0].member_id;
        h.handle.submit(decision.launches[0].clone().into()).unwrap();

        wait_for(h.handle.state(), LauncherState::Busy).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let plan = h.registry.begin_reseed().await;
        let checkpoint = MembershipCheckpoint::new(h.store.clone(), "/sk", "test");
        for id in plan.effects.forget {
            checkpoint.forget(id).await.unwrap();
        }

        // The launch returns into generation 2: no convergence delay.
        wait_for(h.handle.state(), LauncherState::Idle).await;
        assert_eq!(h.driver.launches().len(), 1);
        assert!(h.driver.kills().contains(&TaskHandle::new(member_id, 1)));
        assert!(checkpoint.load_members().await.unwrap().is_empty());
        assert_eq!(
            h.registry.member(&member_id).await.unwrap().state,
            MemberState::Removed
        );

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap();
    }
}
