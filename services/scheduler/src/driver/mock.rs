//! Recording driver for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use seedkeeper_id::{OfferId, TaskHandle};
use tracing::debug;

use super::{DriverError, LaunchSpec, OfferDriver};
use crate::offers::Offer;

/// One recorded driver call.
#[derive(Debug, Clone)]
pub enum DriverCall {
    Launch { offer_id: OfferId, spec: Box<LaunchSpec> },
    Decline { offer_id: OfferId, refuse: Duration },
    Kill(TaskHandle),
    Revive,
    Reconcile(Vec<TaskHandle>),
}

/// Driver that records calls instead of talking to a manager.
#[derive(Debug, Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    fail_launches: AtomicBool,
    launch_delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch is rejected.
    pub fn failing() -> Self {
        Self {
            fail_launches: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Each launch takes `delay` before it returns.
    pub fn with_launch_delay(delay: Duration) -> Self {
        Self {
            launch_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_launches.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().clone()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Launch { spec, .. } => Some(spec.as_ref().clone()),
                _ => None,
            })
            .collect()
    }

    pub fn declines(&self) -> Vec<OfferId> {
        self.lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_id, .. } => Some(offer_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn kills(&self) -> Vec<TaskHandle> {
        self.lock()
            .iter()
            .filter_map(|c| match c {
                DriverCall::Kill(task) => Some(*task),
                _ => None,
            })
            .collect()
    }

    pub fn revives(&self) -> usize {
        self.lock()
            .iter()
            .filter(|c| matches!(c, DriverCall::Revive))
            .count()
    }

    /// Highest number of launches observed running at once.
    pub fn max_concurrent_launches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: DriverCall) {
        self.lock().push(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DriverCall>> {
        // A poisoned lock only means a test thread panicked mid-push
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OfferDriver for MockDriver {
    async fn launch(&self, offer: &Offer, spec: LaunchSpec) -> Result<(), DriverError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }

        debug!(task = %spec.task, offer_id = %offer.id, "[MOCK] Launch");
        self.record(DriverCall::Launch {
            offer_id: offer.id.clone(),
            spec: Box::new(spec),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(DriverError::LaunchRejected(
                "mock driver configured to fail".to_string(),
            ));
        }
        Ok(())
    }

    async fn decline(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError> {
        self.record(DriverCall::Decline {
            offer_id: offer_id.clone(),
            refuse,
        });
        Ok(())
    }

    async fn kill(&self, task: TaskHandle) -> Result<(), DriverError> {
        self.record(DriverCall::Kill(task));
        Ok(())
    }

    async fn revive(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Revive);
        Ok(())
    }

    async fn reconcile(&self, tasks: Vec<TaskHandle>) -> Result<(), DriverError> {
        self.record(DriverCall::Reconcile(tasks));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offers::tests::offer;
    use crate::registry::tests::registry;
    use std::time::Instant;

    async fn spec() -> (Offer, LaunchSpec) {
        let reg = registry(3);
        let o = offer("o1", "h1");
        let decision = reg.match_offers(vec![o.clone()], false, true).await;
        let ctx = reg
            .begin_launch(decision.launches[0].member_id, 1, Instant::now())
            .await
            .unwrap();
        let spec = LaunchSpec::new(&ctx, "test", &Default::default(), vec![]);
        (o, spec)
    }

    #[tokio::test]
    async fn test_records_calls() {
        let driver = MockDriver::new();
        let (offer, spec) = spec().await;
        let task = spec.task;

        driver.launch(&offer, spec).await.unwrap();
        driver.kill(task).await.unwrap();
        driver.revive().await.unwrap();

        assert_eq!(driver.launches().len(), 1);
        assert_eq!(driver.kills(), vec![task]);
        assert_eq!(driver.revives(), 1);
        assert_eq!(driver.max_concurrent_launches(), 1);
    }

    #[tokio::test]
    async fn test_failing_launch() {
        let driver = MockDriver::failing();
        let (offer, spec) = spec().await;
        let err = driver.launch(&offer, spec).await.unwrap_err();
        assert!(matches!(err, DriverError::LaunchRejected(_)));
    }
}
