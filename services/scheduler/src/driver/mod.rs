//! Cluster manager transport interface.
//!
//! The offer transport protocol and its authentication live behind
//! [`OfferDriver`]. Inbound traffic (offers, status updates, registration)
//! reaches the scheduler as [`crate::scheduler::SchedulerEvent`]s; outbound
//! calls go through this trait.
//!
//! Two implementations ship with the crate:
//! - [`MockDriver`] records every call, for tests
//! - [`SimulatedManager`] fabricates a small cluster of hosts for local runs

mod mock;
mod sim;

pub use mock::{DriverCall, MockDriver};
pub use sim::{SimulatedManager, SimulatedHost};

use std::time::Duration;

use async_trait::async_trait;
use seedkeeper_id::{FrameworkId, Generation, HostId, MemberId, OfferId, TaskHandle};
use serde::Serialize;
use thiserror::Error;

use crate::offers::{MemberPorts, MemberRequirements, Offer};
use crate::registry::{BootstrapRole, LaunchContext};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("launch rejected: {0}")]
    LaunchRejected(String),

    #[error("not connected to the cluster manager")]
    Disconnected,

    #[error("transport error: {0}")]
    Transport(String),
}

/// What the scheduler registers with the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkInfo {
    pub name: String,
    /// Session to fail over to, from a previous run.
    pub id: Option<FrameworkId>,
    /// How long the manager keeps the framework's tasks while no scheduler
    /// is connected.
    pub failover_timeout: Duration,
}

/// How a member joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Bootstrap {
    /// Start a new cluster.
    Seed,
    /// Join the listed peers (`{member_id}={peer_url}`).
    Join { peers: Vec<String> },
}

/// Everything the manager needs to start one member.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchSpec {
    pub task: TaskHandle,
    pub member_id: MemberId,
    pub generation: Generation,
    pub cluster_name: String,
    pub host: HostId,
    pub hostname: String,
    pub cpus: f64,
    pub mem_mb: f64,
    pub disk_mb: f64,
    pub ports: MemberPorts,
    /// URIs the host fetches the executor and store binaries from.
    pub artifacts: Vec<String>,
    pub bootstrap: Bootstrap,
}

impl LaunchSpec {
    pub fn new(
        ctx: &LaunchContext,
        cluster_name: &str,
        requirements: &MemberRequirements,
        artifacts: Vec<String>,
    ) -> Self {
        let member = &ctx.member;
        let bootstrap = match member.role {
            BootstrapRole::Seed => Bootstrap::Seed,
            BootstrapRole::Join => Bootstrap::Join {
                peers: ctx
                    .peers
                    .iter()
                    .map(|(id, url)| format!("{id}={url}"))
                    .collect(),
            },
        };

        Self {
            task: member.handle(),
            member_id: member.id,
            generation: member.generation,
            cluster_name: cluster_name.to_string(),
            host: member.host.clone(),
            hostname: member.hostname.clone(),
            cpus: requirements.cpus,
            mem_mb: requirements.mem_mb,
            disk_mb: requirements.disk_mb,
            ports: member.ports,
            artifacts,
            bootstrap,
        }
    }
}

/// Outbound calls to the cluster manager.
#[async_trait]
pub trait OfferDriver: Send + Sync {
    /// Launch one member task using `offer`.
    async fn launch(&self, offer: &Offer, spec: LaunchSpec) -> Result<(), DriverError>;

    /// Decline an offer, asking the manager to hold it back for `refuse`.
    async fn decline(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError>;

    /// Kill a task.
    async fn kill(&self, task: TaskHandle) -> Result<(), DriverError>;

    /// Ask the manager to resume sending offers.
    async fn revive(&self) -> Result<(), DriverError>;

    /// Ask the manager to report the current status of `tasks`.
    async fn reconcile(&self, tasks: Vec<TaskHandle>) -> Result<(), DriverError>;
}
