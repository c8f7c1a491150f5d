//! Periodic launch requestor.
//!
//! Every tick expires overdue members, then compares the desired size with
//! the active members. When members are missing it records launch intents
//! and asks the manager to revive offers, so a declined host gets offered
//! again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::driver::OfferDriver;
use crate::registry::MemberRegistry;
use crate::status::StatusReconciler;

pub struct LaunchRequestor {
    registry: Arc<MemberRegistry>,
    driver: Arc<dyn OfferDriver>,
    reconciler: Arc<StatusReconciler>,
    interval: Duration,
}

impl LaunchRequestor {
    pub fn new(
        registry: Arc<MemberRegistry>,
        driver: Arc<dyn OfferDriver>,
        reconciler: Arc<StatusReconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            driver,
            reconciler,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting launch requestor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Instant::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Launch requestor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass. Returns the number of intents added.
    pub async fn tick(&self, now: Instant) -> usize {
        self.reconciler.expire(now).await;

        let added = self.registry.request_launches().await;
        if added == 0 {
            debug!("No launch gap");
            return 0;
        }

        let counts = self.registry.counts().await;
        info!(
            intents = added,
            active = counts.active(),
            desired = self.registry.desired(),
            "Requesting launches"
        );
        if let Err(e) = self.driver.revive().await {
            warn!(error = %e, "Failed to revive offers");
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MembershipCheckpoint, MemoryStore};
    use crate::driver::MockDriver;
    use crate::registry::tests::{registry, running_member};

    fn requestor(reg: Arc<MemberRegistry>, driver: Arc<MockDriver>) -> LaunchRequestor {
        let checkpoint = MembershipCheckpoint::new(Arc::new(MemoryStore::new()), "/sk", "t");
        let reconciler = Arc::new(StatusReconciler::new(
            reg.clone(),
            driver.clone(),
            checkpoint,
            Duration::from_secs(30),
            Duration::from_secs(300),
        ));
        LaunchRequestor::new(reg, driver, reconciler, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let reg = Arc::new(registry(3));
        let driver = Arc::new(MockDriver::new());
        let r = requestor(reg.clone(), driver.clone());
        let now = Instant::now();
        running_member(&reg, "h1", now).await;

        assert_eq!(r.tick(now).await, 2);
        assert_eq!(r.tick(now).await, 0);
        assert_eq!(r.tick(now).await, 0);
        assert_eq!(reg.outstanding_intents().await, 2);
        assert_eq!(driver.revives(), 1);
    }

    #[tokio::test]
    async fn test_full_cluster_requests_nothing() {
        let reg = Arc::new(registry(1));
        let driver = Arc::new(MockDriver::new());
        let r = requestor(reg.clone(), driver.clone());
        running_member(&reg, "h1", Instant::now()).await;

        assert_eq!(r.tick(Instant::now()).await, 0);
        assert_eq!(driver.revives(), 0);
    }
}
