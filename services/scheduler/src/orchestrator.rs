//! Wires the scheduler's workers together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admin::AdminState;
use crate::config::SchedulerConfig;
use crate::coordination::{CoordinationStore, MembershipCheckpoint, SessionIdentity};
use crate::driver::OfferDriver;
use crate::error::Result;
use crate::health::{HealthMonitor, HealthProbe};
use crate::launcher::{LaunchTemplate, SerialLauncher};
use crate::registry::MemberRegistry;
use crate::requestor::LaunchRequestor;
use crate::reseed::{ReseedController, ReseedHandle, ReseedSettings};
use crate::scheduler::{ClusterScheduler, SchedulerEvent};
use crate::status::StatusReconciler;

/// Capacity of the facade's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Create the facade's event queue.
pub fn event_channel() -> (mpsc::Sender<SchedulerEvent>, mpsc::Receiver<SchedulerEvent>) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

/// External collaborators the workers run against.
pub struct Dependencies {
    pub store: Arc<dyn CoordinationStore>,
    pub driver: Arc<dyn OfferDriver>,
    pub probe: Arc<dyn HealthProbe>,
    /// Artifact URIs placed into every launch spec.
    pub artifacts: Vec<String>,
}

/// A started scheduler.
pub struct RunningScheduler {
    pub events: mpsc::Sender<SchedulerEvent>,
    pub registry: Arc<MemberRegistry>,
    pub scheduler: Arc<ClusterScheduler>,
    pub reseed: ReseedHandle,
    pub admin: AdminState,
    pub identity: SessionIdentity,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl RunningScheduler {
    /// Receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every worker and wait for each up to `timeout`.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        info!("Waiting for workers to shut down...");
        for (name, handle) in self.tasks {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(worker = name, "Worker did not shut down in time");
            }
        }
        info!("Scheduler shutdown complete");
    }
}

/// Restore the checkpoint and start every worker.
pub async fn start(
    config: &SchedulerConfig,
    deps: Dependencies,
    events: (mpsc::Sender<SchedulerEvent>, mpsc::Receiver<SchedulerEvent>),
) -> Result<RunningScheduler> {
    let (events_tx, events_rx) = events;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let checkpoint = MembershipCheckpoint::new(
        deps.store.clone(),
        &config.persist_chroot,
        &config.cluster_name,
    );
    let identity = SessionIdentity::new(
        deps.store.clone(),
        &config.persist_chroot,
        &config.cluster_name,
    );

    let registry = Arc::new(MemberRegistry::new(
        config.desired_members,
        config.single_instance_per_host,
        config.member_requirements.clone(),
    ));
    match checkpoint.load_generation().await? {
        Some(generation) => {
            let (records, stale): (Vec<_>, Vec<_>) = checkpoint
                .load_members()
                .await?
                .into_iter()
                .partition(|r| r.generation == generation);
            for record in stale {
                info!(
                    member_id = %record.member_id,
                    generation = record.generation,
                    "Deleting checkpoint from an earlier generation"
                );
                if let Err(e) = checkpoint.forget(record.member_id).await {
                    warn!(member_id = %record.member_id, error = %e, "Failed to delete stale checkpoint");
                }
            }
            registry.restore(generation, records, Instant::now()).await;
        }
        None => checkpoint.save_generation(1).await?,
    }
    let generation = registry.generation().await;

    let reconciler = Arc::new(StatusReconciler::new(
        registry.clone(),
        deps.driver.clone(),
        checkpoint.clone(),
        config.unhealthy_grace,
        config.launch_timeout,
    ));

    let (launcher, launcher_handle) = SerialLauncher::new(
        registry.clone(),
        deps.driver.clone(),
        checkpoint.clone(),
        LaunchTemplate {
            cluster_name: config.cluster_name.clone(),
            requirements: config.member_requirements.clone(),
            artifacts: deps.artifacts.clone(),
            convergence_delay: config.convergence_delay,
        },
    );

    let requestor = LaunchRequestor::new(
        registry.clone(),
        deps.driver.clone(),
        reconciler.clone(),
        config.launch_request_interval,
    );

    let (controller, reseed) = ReseedController::new(
        registry.clone(),
        deps.driver.clone(),
        reconciler.clone(),
        checkpoint.clone(),
        ReseedSettings {
            auto_reseed: config.auto_reseed,
            reseed_timeout: config.reseed_timeout,
            health_window: config.health_window,
            interval: config.health_check_interval,
        },
        generation,
    );

    let monitor = HealthMonitor::new(
        registry.clone(),
        deps.probe.clone(),
        events_tx.clone(),
        config.health_check_interval,
    );

    let scheduler = Arc::new(ClusterScheduler::new(
        registry.clone(),
        deps.driver.clone(),
        launcher_handle.clone(),
        reconciler,
        identity.clone(),
    ));

    let admin = AdminState::new(
        config.cluster_name.clone(),
        registry.clone(),
        reseed.clone(),
        launcher_handle.state(),
    );

    let tasks = vec![
        (
            "scheduler",
            tokio::spawn({
                let scheduler = scheduler.clone();
                let shutdown_rx = shutdown_rx.clone();
                async move { scheduler.run(events_rx, shutdown_rx).await }
            }),
        ),
        ("launcher", tokio::spawn(launcher.run(shutdown_rx.clone()))),
        (
            "requestor",
            tokio::spawn({
                let shutdown_rx = shutdown_rx.clone();
                async move { requestor.run(shutdown_rx).await }
            }),
        ),
        (
            "reseed-controller",
            tokio::spawn(controller.run(shutdown_rx.clone())),
        ),
        (
            "health-monitor",
            tokio::spawn(async move { monitor.run(shutdown_rx).await }),
        ),
    ];

    info!(
        cluster = %config.cluster_name,
        desired = config.desired_members,
        generation,
        "Scheduler started"
    );

    Ok(RunningScheduler {
        events: events_tx,
        registry,
        scheduler,
        reseed,
        admin,
        identity,
        shutdown: shutdown_tx,
        tasks,
    })
}
