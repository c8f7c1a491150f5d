//! Simulated cluster manager for local runs.
//!
//! Fabricates offers from a fixed host list and answers launches and kills
//! with status events pushed straight into the scheduler's event queue. It
//! also acts as the health probe, since simulated members have no endpoint.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use seedkeeper_id::{FrameworkId, HostId, OfferId, TaskHandle};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, instrument, warn};

use super::{DriverError, FrameworkInfo, LaunchSpec, OfferDriver};
use crate::health::HealthProbe;
use crate::offers::{Offer, PortRange, Resources};
use crate::registry::ProbeTarget;
use crate::scheduler::SchedulerEvent;
use crate::status::{StatusEvent, StatusSource, TaskState};

/// A host the simulator offers.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    pub id: HostId,
    pub hostname: String,
    pub resources: Resources,
}

impl SimulatedHost {
    /// `count` identical hosts named `sim-1` .. `sim-{count}`.
    pub fn numbered(count: usize) -> Vec<Self> {
        (1..=count)
            .map(|i| Self {
                id: HostId::new(format!("sim-{i}")),
                hostname: format!("sim-{i}.local"),
                resources: Resources {
                    cpus: 4.0,
                    mem_mb: 8192.0,
                    disk_mb: 20480.0,
                    ports: vec![PortRange {
                        begin: 31000,
                        end: 31999,
                    }],
                },
            })
            .collect()
    }
}

#[derive(Debug)]
struct Slot {
    host: SimulatedHost,
    task: Option<TaskHandle>,
    outstanding: Option<OfferId>,
    refused_until: Option<Instant>,
}

#[derive(Debug)]
struct SimState {
    slots: BTreeMap<HostId, Slot>,
    next_offer: u64,
}

/// In-process stand-in for the cluster manager.
pub struct SimulatedManager {
    state: Mutex<SimState>,
    events: mpsc::Sender<SchedulerEvent>,
    revived: Notify,
    offer_interval: Duration,
    start_delay: Duration,
}

impl SimulatedManager {
    pub fn new(hosts: Vec<SimulatedHost>, events: mpsc::Sender<SchedulerEvent>) -> Self {
        let slots = hosts
            .into_iter()
            .map(|host| {
                (
                    host.id.clone(),
                    Slot {
                        host,
                        task: None,
                        outstanding: None,
                        refused_until: None,
                    },
                )
            })
            .collect();
        Self {
            state: Mutex::new(SimState {
                slots,
                next_offer: 0,
            }),
            events,
            revived: Notify::new(),
            offer_interval: Duration::from_secs(1),
            start_delay: Duration::from_millis(200),
        }
    }

    /// Register, then keep offering idle hosts until shutdown.
    ///
    /// A framework with a previous session ID keeps it; otherwise the
    /// simulator assigns `sim-{name}`.
    #[instrument(skip_all, fields(framework = %framework.name))]
    pub async fn run(&self, framework: FrameworkInfo, mut shutdown: watch::Receiver<bool>) {
        let framework_id = Self::assign_id(&framework);
        info!(
            framework_id = %framework_id,
            failover = framework.id.is_some(),
            failover_timeout_secs = framework.failover_timeout.as_secs(),
            "Simulated manager registering scheduler"
        );
        if self
            .events
            .send(SchedulerEvent::Registered { framework_id })
            .await
            .is_err()
        {
            return;
        }

        let mut interval = tokio::time::interval(self.offer_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.revived.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Simulated manager shutting down");
                        break;
                    }
                    continue;
                }
            }

            let offers = self.fabricate_offers(Instant::now()).await;
            if offers.is_empty() {
                continue;
            }
            debug!(count = offers.len(), "Sending simulated offers");
            if self.events.send(SchedulerEvent::Offers(offers)).await.is_err() {
                break;
            }
        }
    }

    fn assign_id(framework: &FrameworkInfo) -> FrameworkId {
        framework
            .id
            .clone()
            .unwrap_or_else(|| FrameworkId::new(format!("sim-{}", framework.name)))
    }

    /// Drop a host, as if its agent disappeared.
    pub async fn lose_host(&self, host: &HostId) {
        let removed = self.state.lock().await.slots.remove(host);
        if removed.is_some() {
            warn!(host = %host, "Simulated host lost");
            let _ = self.events.send(SchedulerEvent::AgentLost(host.clone())).await;
        }
    }

    async fn fabricate_offers(&self, now: Instant) -> Vec<Offer> {
        let mut state = self.state.lock().await;
        let mut next = state.next_offer;
        let mut offers = Vec::new();
        for slot in state.slots.values_mut() {
            let refused = slot.refused_until.is_some_and(|until| until > now);
            if slot.task.is_some() || slot.outstanding.is_some() || refused {
                continue;
            }
            next += 1;
            let id = OfferId::new(format!("sim-offer-{next}"));
            slot.outstanding = Some(id.clone());
            offers.push(Offer {
                id,
                host: slot.host.id.clone(),
                hostname: slot.host.hostname.clone(),
                resources: slot.host.resources.clone(),
            });
        }
        state.next_offer = next;
        offers
    }

    async fn send_status(&self, task: TaskHandle, state: TaskState, host: Option<HostId>) {
        let event = StatusEvent {
            task: task.to_string(),
            state,
            healthy: matches!(state, TaskState::Running).then_some(true),
            host,
            reason: None,
            source: StatusSource::Manager,
        };
        let _ = self.events.send(SchedulerEvent::Status(event)).await;
    }
}

#[async_trait]
impl OfferDriver for SimulatedManager {
    async fn launch(&self, offer: &Offer, spec: LaunchSpec) -> Result<(), DriverError> {
        {
            let mut state = self.state.lock().await;
            let slot = state
                .slots
                .get_mut(&offer.host)
                .ok_or_else(|| DriverError::LaunchRejected(format!("unknown host {}", offer.host)))?;
            if slot.outstanding.as_ref() != Some(&offer.id) {
                return Err(DriverError::LaunchRejected(format!(
                    "offer {} is no longer valid",
                    offer.id
                )));
            }
            slot.outstanding = None;
            slot.task = Some(spec.task);
        }

        info!(task = %spec.task, host = %offer.host, "Simulated launch");
        self.send_status(spec.task, TaskState::Staging, Some(offer.host.clone()))
            .await;

        let events = self.events.clone();
        let delay = self.start_delay;
        let task = spec.task;
        let host = offer.host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event = StatusEvent {
                task: task.to_string(),
                state: TaskState::Running,
                healthy: Some(true),
                host: Some(host),
                reason: None,
                source: StatusSource::Manager,
            };
            let _ = events.send(SchedulerEvent::Status(event)).await;
        });
        Ok(())
    }

    async fn decline(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        if let Some(slot) = state
            .slots
            .values_mut()
            .find(|s| s.outstanding.as_ref() == Some(offer_id))
        {
            slot.outstanding = None;
            slot.refused_until = Some(Instant::now() + refuse);
        }
        Ok(())
    }

    async fn kill(&self, task: TaskHandle) -> Result<(), DriverError> {
        let host = {
            let mut state = self.state.lock().await;
            state
                .slots
                .values_mut()
                .find(|s| s.task == Some(task))
                .map(|slot| {
                    slot.task = None;
                    slot.host.id.clone()
                })
        };
        if host.is_some() {
            info!(task = %task, "Simulated kill");
            self.send_status(task, TaskState::Killed, host).await;
        }
        Ok(())
    }

    async fn revive(&self) -> Result<(), DriverError> {
        {
            let mut state = self.state.lock().await;
            for slot in state.slots.values_mut() {
                slot.refused_until = None;
            }
        }
        self.revived.notify_one();
        Ok(())
    }

    async fn reconcile(&self, tasks: Vec<TaskHandle>) -> Result<(), DriverError> {
        for task in tasks {
            let host = {
                let state = self.state.lock().await;
                state
                    .slots
                    .values()
                    .find(|s| s.task == Some(task))
                    .map(|s| s.host.id.clone())
            };
            match host {
                Some(host) => self.send_status(task, TaskState::Running, Some(host)).await,
                None => self.send_status(task, TaskState::Lost, None).await,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for SimulatedManager {
    async fn probe(&self, target: &ProbeTarget) -> bool {
        let state = self.state.lock().await;
        state
            .slots
            .get(&target.host)
            .is_some_and(|s| s.task == Some(target.handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offers_only_idle_hosts_once() {
        let (tx, _rx) = mpsc::channel(16);
        let sim = SimulatedManager::new(SimulatedHost::numbered(3), tx);

        let first = sim.fabricate_offers(Instant::now()).await;
        assert_eq!(first.len(), 3);

        // Outstanding offers are not repeated
        assert!(sim.fabricate_offers(Instant::now()).await.is_empty());

        sim.decline(&first[0].id, Duration::from_secs(60)).await.unwrap();
        assert!(sim.fabricate_offers(Instant::now()).await.is_empty());

        sim.revive().await.unwrap();
        assert_eq!(sim.fabricate_offers(Instant::now()).await.len(), 1);
    }

    fn framework(id: Option<&str>) -> FrameworkInfo {
        FrameworkInfo {
            name: "seedkeeper-test".to_string(),
            id: id.map(FrameworkId::new),
            failover_timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_registration_keeps_previous_framework_id() {
        let (tx, mut rx) = mpsc::channel(16);
        let sim = SimulatedManager::new(Vec::new(), tx);
        // A dropped sender ends the offer loop right after registration.
        let (_, shutdown_rx) = watch::channel(false);

        sim.run(framework(Some("fw-previous")), shutdown_rx.clone()).await;
        match rx.recv().await {
            Some(SchedulerEvent::Registered { framework_id }) => {
                assert_eq!(framework_id, FrameworkId::new("fw-previous"))
            }
            other => panic!("unexpected event: {other:?}"),
        }

        sim.run(framework(None), shutdown_rx).await;
        match rx.recv().await {
            Some(SchedulerEvent::Registered { framework_id }) => {
                assert_eq!(framework_id, FrameworkId::new("sim-seedkeeper-test"))
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lose_host_emits_agent_lost() {
        let (tx, mut rx) = mpsc::channel(16);
        let sim = SimulatedManager::new(SimulatedHost::numbered(1), tx);
        sim.lose_host(&HostId::new("sim-1")).await;

        match rx.recv().await {
            Some(SchedulerEvent::AgentLost(host)) => assert_eq!(host, HostId::new("sim-1")),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
