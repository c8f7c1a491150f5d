//! Member health probing.
//!
//! Every interval, each running or unhealthy member with a live task is
//! probed. Results are pushed into the scheduler's event queue as
//! probe-sourced status events, so they are applied in order with manager
//! updates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

use crate::registry::{MemberRegistry, ProbeTarget};
use crate::scheduler::SchedulerEvent;
use crate::status::StatusEvent;

/// Checks whether one member is healthy.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> bool;
}

/// Probes `GET http://{hostname}:{client_port}/health`; any 2xx is healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn url(target: &ProbeTarget) -> String {
        format!("http://{}:{}/health", target.hostname, target.client_port)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, target: &ProbeTarget) -> bool {
        match self.client.get(Self::url(target)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(task = %target.handle, error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Periodically probes members.
pub struct HealthMonitor {
    registry: Arc<MemberRegistry>,
    probe: Arc<dyn HealthProbe>,
    events: mpsc::Sender<SchedulerEvent>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<MemberRegistry>,
        probe: Arc<dyn HealthProbe>,
        events: mpsc::Sender<SchedulerEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            probe,
            events,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting health monitor");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.probe_all().await.is_err() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every target once and enqueue the results.
    ///
    /// Fails only when the event queue is closed.
    pub async fn probe_all(&self) -> Result<usize, mpsc::error::SendError<SchedulerEvent>> {
        let targets = self.registry.probe_targets().await;
        let results = join_all(targets.iter().map(|t| self.probe.probe(t))).await;

        let mut unhealthy = 0;
        for (target, healthy) in targets.iter().zip(results) {
            if !healthy {
                unhealthy += 1;
            }
            self.events
                .send(SchedulerEvent::Status(StatusEvent::probe(target.handle, healthy)))
                .await?;
        }
        if !targets.is_empty() {
            debug!(probed = targets.len(), unhealthy, "Probed members");
        }
        Ok(targets.len())
    }
}
