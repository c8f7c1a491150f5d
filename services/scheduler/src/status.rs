//! Status reconciliation.
//!
//! Task status updates from the manager and health probe results arrive as
//! [`StatusEvent`]s. Each event is classified, applied to the registry, and
//! the resulting kills and checkpoint deletions are carried out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use seedkeeper_id::{HostId, TaskHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coordination::MembershipCheckpoint;
use crate::driver::OfferDriver;
use crate::registry::{Discard, Effects, MemberRegistry, StatusOutcome};

/// Task state as reported by the cluster manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
    Dropped,
    Unreachable,
}

/// Where a status event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Manager,
    Probe,
}

/// What a status means for the member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Still starting.
    Pending,
    Healthy,
    /// Alive but failing health checks, or unreachable.
    Degraded,
    /// The task is gone.
    Terminal,
}

/// One status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Task handle as reported; may be garbage.
    pub task: String,
    pub state: TaskState,
    /// Health check result attached to the update, if any.
    pub healthy: Option<bool>,
    pub host: Option<HostId>,
    pub reason: Option<String>,
    pub source: StatusSource,
}

impl StatusEvent {
    /// Probe result for a member.
    pub fn probe(task: TaskHandle, healthy: bool) -> Self {
        Self {
            task: task.to_string(),
            state: TaskState::Running,
            healthy: Some(healthy),
            host: None,
            reason: (!healthy).then(|| "health probe failed".to_string()),
            source: StatusSource::Probe,
        }
    }

    pub fn class(&self) -> StatusClass {
        classify(self.state, self.healthy)
    }
}

/// Map a task state and health flag to a class.
pub fn classify(state: TaskState, healthy: Option<bool>) -> StatusClass {
    match state {
        TaskState::Staging | TaskState::Starting => StatusClass::Pending,
        TaskState::Running => match healthy {
            Some(false) => StatusClass::Degraded,
            Some(true) | None => StatusClass::Healthy,
        },
        TaskState::Unreachable => StatusClass::Degraded,
        TaskState::Finished
        | TaskState::Failed
        | TaskState::Killed
        | TaskState::Lost
        | TaskState::Error
        | TaskState::Dropped => StatusClass::Terminal,
    }
}

/// Applies status events to the registry.
pub struct StatusReconciler {
    registry: Arc<MemberRegistry>,
    driver: Arc<dyn OfferDriver>,
    checkpoint: MembershipCheckpoint,
    unhealthy_grace: Duration,
    launch_timeout: Duration,
}

impl StatusReconciler {
    pub fn new(
        registry: Arc<MemberRegistry>,
        driver: Arc<dyn OfferDriver>,
        checkpoint: MembershipCheckpoint,
        unhealthy_grace: Duration,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            driver,
            checkpoint,
            unhealthy_grace,
            launch_timeout,
        }
    }

    /// Apply one event.
    pub async fn apply(&self, event: &StatusEvent, now: Instant) -> StatusOutcome {
        let handle = match TaskHandle::parse(&event.task) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(task = %event.task, error = %e, "Discarding status for unknown task");
                return StatusOutcome::Discarded(Discard::UnknownMember);
            }
        };

        let class = event.class();
        let (outcome, effects) = self
            .registry
            .apply_status(handle, class, event.source, now)
            .await;

        match outcome {
            StatusOutcome::Discarded(reason) => {
                debug!(task = %handle, state = ?event.state, reason = ?reason, "Discarded status");
            }
            StatusOutcome::Unhealthy => {
                warn!(
                    task = %handle,
                    state = ?event.state,
                    reason = event.reason.as_deref().unwrap_or(""),
                    "Member reported unhealthy"
                );
            }
            StatusOutcome::Started { seed: true } => {
                info!(task = %handle, "Seed member running");
            }
            _ => {}
        }

        self.execute(effects).await;
        outcome
    }

    /// Remove members whose grace period or launch timeout has run out.
    pub async fn expire(&self, now: Instant) {
        let effects = self
            .registry
            .expire(now, self.unhealthy_grace, self.launch_timeout)
            .await;
        self.execute(effects).await;
    }

    /// Kill tasks and delete checkpoints, logging failures.
    pub async fn execute(&self, effects: Effects) {
        for task in effects.kill {
            if let Err(e) = self.driver.kill(task).await {
                warn!(task = %task, error = %e, "Failed to kill task");
            }
        }
        for member_id in effects.forget {
            if let Err(e) = self.checkpoint.forget(member_id).await {
                warn!(member_id = %member_id, error = %e, "Failed to delete member checkpoint");
            }
        }
    }
}
