//! Reseed controller.
//!
//! Feeds quorum readings from the registry into the [`LivelockDetector`].
//! Once the cluster has been without quorum for the reseed timeout it is
//! livelocked: with auto-reseed enabled every member is removed, the
//! generation is bumped and a single seed member starts a new cluster.
//! With auto-reseed disabled the controller only reports the livelock.
//! An operator can force a reseed through the admin API either way.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use seedkeeper_id::Generation;
use seedkeeper_reconcile::{ClusterPhase, LivelockDetector, PhaseChange, QuorumReading};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, instrument, warn};

use crate::coordination::MembershipCheckpoint;
use crate::driver::OfferDriver;
use crate::registry::MemberRegistry;
use crate::status::StatusReconciler;

/// Published controller state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub phase: ClusterPhase,
    pub generation: Generation,
    /// Seconds since the current phase was entered.
    pub seconds_in_phase: u64,
    /// Seconds the cluster has been without quorum, if it is.
    pub seconds_without_quorum: Option<u64>,
    pub healthy_members: usize,
    pub quorum: usize,
    pub auto_reseed: bool,
    pub last_reseed: Option<DateTime<Utc>>,
    pub reseed_count: u64,
}

/// Operator request for a reseed.
#[derive(Debug, Clone)]
pub struct ReseedRequest {
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("reseed controller is not running")]
pub struct ControllerGone;

/// Handle for reading controller status and requesting reseeds.
#[derive(Clone)]
pub struct ReseedHandle {
    requests: mpsc::Sender<ReseedRequest>,
    status: watch::Receiver<ControllerStatus>,
}

impl ReseedHandle {
    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Ask for a reseed. A request already waiting covers this one.
    pub fn trigger(&self, reason: impl Into<String>) -> Result<(), ControllerGone> {
        match self.requests.try_send(ReseedRequest {
            reason: reason.into(),
        }) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ControllerGone),
        }
    }
}

/// Settings for the controller.
#[derive(Debug, Clone)]
pub struct ReseedSettings {
    pub auto_reseed: bool,
    pub reseed_timeout: Duration,
    pub health_window: Duration,
    pub interval: Duration,
}

pub struct ReseedController {
    registry: Arc<MemberRegistry>,
    driver: Arc<dyn OfferDriver>,
    reconciler: Arc<StatusReconciler>,
    checkpoint: MembershipCheckpoint,
    settings: ReseedSettings,
    detector: LivelockDetector,
    last_reading: QuorumReading,
    last_reseed: Option<DateTime<Utc>>,
    reseed_count: u64,
    requests: mpsc::Receiver<ReseedRequest>,
    status: watch::Sender<ControllerStatus>,
}

impl ReseedController {
    pub fn new(
        registry: Arc<MemberRegistry>,
        driver: Arc<dyn OfferDriver>,
        reconciler: Arc<StatusReconciler>,
        checkpoint: MembershipCheckpoint,
        settings: ReseedSettings,
        generation: Generation,
    ) -> (Self, ReseedHandle) {
        let now = Instant::now();
        let detector = LivelockDetector::new(settings.reseed_timeout, now);
        let last_reading = QuorumReading::new(0, registry.desired());
        let (requests_tx, requests) = mpsc::channel(4);
        let (status, status_rx) = watch::channel(ControllerStatus {
            phase: detector.phase(),
            generation,
            seconds_in_phase: 0,
            seconds_without_quorum: Some(0),
            healthy_members: 0,
            quorum: last_reading.required,
            auto_reseed: settings.auto_reseed,
            last_reseed: None,
            reseed_count: 0,
        });

        let controller = Self {
            registry,
            driver,
            reconciler,
            checkpoint,
            settings,
            detector,
            last_reading,
            last_reseed: None,
            reseed_count: 0,
            requests,
            status,
        };
        let handle = ReseedHandle {
            requests: requests_tx,
            status: status_rx,
        };
        (controller, handle)
    }

    pub fn phase(&self) -> ClusterPhase {
        self.detector.phase()
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            auto_reseed = self.settings.auto_reseed,
            reseed_timeout_secs = self.settings.reseed_timeout.as_secs(),
            "Starting reseed controller"
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.evaluate(Instant::now()).await;
                }
                Some(request) = self.requests.recv() => {
                    warn!(reason = %request.reason, "Manual reseed requested");
                    self.reseed(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reseed controller shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One evaluation at `now`. Returns the phase change it caused, if any.
    pub async fn evaluate(&mut self, now: Instant) -> Option<PhaseChange> {
        let change = if self.detector.phase() == ClusterPhase::Reseeding {
            if self.registry.seed_pending().await {
                None
            } else {
                self.detector.finish_reseed(now)
            }
        } else {
            let reading = self
                .registry
                .quorum_reading(now, self.settings.health_window)
                .await;
            self.last_reading = reading;
            self.detector.observe(reading, now)
        };

        if let Some(change) = change {
            self.log_change(change);
        }

        if self.detector.phase() == ClusterPhase::Livelocked && self.settings.auto_reseed {
            self.reseed(now).await;
        }

        self.publish(now).await;
        change
    }

    /// Remove every member and start a new generation.
    pub async fn reseed(&mut self, now: Instant) -> Generation {
        let plan = self.registry.begin_reseed().await;
        self.reconciler.execute(plan.effects).await;

        if let Err(e) = self.checkpoint.save_generation(plan.generation).await {
            warn!(generation = plan.generation, error = %e, "Failed to checkpoint generation");
        }

        if let Some(change) = self.detector.begin_reseed(plan.generation, now) {
            self.log_change(change);
        }
        self.last_reseed = Some(Utc::now());
        self.reseed_count += 1;

        info!(
            previous = plan.previous,
            generation = plan.generation,
            removed = plan.removed.len(),
            "Reseed started, waiting for seed member"
        );

        if let Err(e) = self.driver.revive().await {
            warn!(error = %e, "Failed to revive offers after reseed");
        }

        self.publish(now).await;
        plan.generation
    }

    fn log_change(&self, change: PhaseChange) {
        match change.to {
            ClusterPhase::Livelocked => error!(
                from = %change.from,
                auto_reseed = self.settings.auto_reseed,
                healthy = self.last_reading.healthy,
                required = self.last_reading.required,
                "Cluster livelocked"
            ),
            ClusterPhase::Degraded => warn!(
                from = %change.from,
                healthy = self.last_reading.healthy,
                required = self.last_reading.required,
                "Cluster lost quorum"
            ),
            ClusterPhase::Healthy | ClusterPhase::Reseeding => {
                info!(from = %change.from, to = %change.to, "Cluster phase changed")
            }
        }
    }

    async fn publish(&self, now: Instant) {
        let generation = self.registry.generation().await;
        let status = ControllerStatus {
            phase: self.detector.phase(),
            generation,
            seconds_in_phase: now
                .saturating_duration_since(self.detector.entered_at())
                .as_secs(),
            seconds_without_quorum: self
                .detector
                .without_quorum_since()
                .map(|since| now.saturating_duration_since(since).as_secs()),
            healthy_members: self.last_reading.healthy,
            quorum: self.last_reading.required,
            auto_reseed: self.settings.auto_reseed,
            last_reseed: self.last_reseed,
            reseed_count: self.reseed_count,
        };
        self.status.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use crate::driver::MockDriver;
    use crate::registry::tests::{registry, running_member};
    use crate::status::{StatusClass, StatusSource};
    use seedkeeper_id::TaskHandle;

    fn controller(
        reg: Arc<MemberRegistry>,
        driver: Arc<MockDriver>,
        auto_reseed: bool,
    ) -> (ReseedController, ReseedHandle) {
        let checkpoint = MembershipCheckpoint::new(Arc::new(MemoryStore::new()), "/sk", "t");
        let reconciler = Arc::new(StatusReconciler::new(
            reg.clone(),
            driver.clone(),
            checkpoint.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        ReseedController::new(
            reg,
            driver,
            reconciler,
            checkpoint,
            ReseedSettings {
                auto_reseed,
                reseed_timeout: Duration::from_secs(240),
                health_window: Duration::from_secs(3600),
                interval: Duration::from_secs(10),
            },
            1,
        )
    }

    #[tokio::test]
    async fn test_seed_running_finishes_reseed() {
        let reg = Arc::new(registry(3));
        let driver = Arc::new(MockDriver::new());
        let (mut c, handle) = controller(reg.clone(), driver.clone(), true);
        let t0 = Instant::now();

        assert_eq!(c.reseed(t0).await, 2);
        assert_eq!(c.phase(), ClusterPhase::Reseeding);
        assert_eq!(handle.status().reseed_count, 1);
        assert_eq!(driver.revives(), 1);

        // Readings are ignored while the seed is pending
        assert_eq!(c.evaluate(t0).await, None);
        assert_eq!(c.phase(), ClusterPhase::Reseeding);

        running_member(&reg, "h1", t0).await;
        let change = c.evaluate(t0).await.unwrap();
        assert_eq!(change.to, ClusterPhase::Healthy);
        assert_eq!(handle.status().generation, 2);
    }

    #[tokio::test]
    async fn test_flap_resets_clock() {
        let reg = Arc::new(registry(1));
        let driver = Arc::new(MockDriver::new());
        let (mut c, _handle) = controller(reg.clone(), driver, true);
        let t0 = Instant::now();
        let id = running_member(&reg, "h1", t0).await;
        let task = TaskHandle::new(id, 1);
        c.evaluate(t0).await;
        assert_eq!(c.phase(), ClusterPhase::Healthy);

        let secs = Duration::from_secs;
        reg.apply_status(task, StatusClass::Degraded, StatusSource::Probe, t0 + secs(1))
            .await;
        c.evaluate(t0 + secs(200)).await;
        assert_eq!(c.phase(), ClusterPhase::Degraded);

        reg.apply_status(task, StatusClass::Healthy, StatusSource::Probe, t0 + secs(201))
            .await;
        c.evaluate(t0 + secs(201)).await;
        assert_eq!(c.phase(), ClusterPhase::Healthy);

        reg.apply_status(task, StatusClass::Degraded, StatusSource::Probe, t0 + secs(202))
            .await;
        // 250s after the first loss, but the healthy reading restarted the clock
        c.evaluate(t0 + secs(450)).await;
        assert_eq!(c.phase(), ClusterPhase::Degraded);
    }

    #[tokio::test]
    async fn test_trigger_after_controller_dropped() {
        let reg = Arc::new(registry(1));
        let (c, handle) = controller(reg, Arc::new(MockDriver::new()), false);
        assert!(handle.trigger("test").is_ok());
        drop(c);
        assert!(handle.trigger("test").is_err());
    }
}
