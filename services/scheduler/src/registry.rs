//! Member registry.
//!
//! The registry is the in-memory record of desired versus actual members.
//! Every mutation happens under one `RwLock`; methods never await I/O while
//! holding it. Side effects a mutation requires (tasks to kill, checkpoints
//! to delete) are returned to the caller as [`Effects`] and executed after
//! the lock is released.
//!
//! ## Member lifecycle
//!
//! ```text
//! Requested -> Launching -> Running <-> Unhealthy -> Removed
//!     |            |
//!     +------------+--> Failed (rolled back before reaching the manager)
//! ```

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use seedkeeper_id::{Generation, HostId, MemberId, OfferId, TaskHandle};
use seedkeeper_reconcile::{launch_gap, LaunchGate, QuorumReading};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::offers::{
    match_offers, DeclineReason, DeclinedOffer, MatchView, MemberPorts, MemberRequirements, Offer,
};
use crate::status::{StatusClass, StatusSource};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("member not found: {0}")]
    UnknownMember(MemberId),

    #[error("generation {requested} is stale (current {current})")]
    StaleGeneration {
        requested: Generation,
        current: Generation,
    },

    #[error("member {member_id} is {state}, expected {expected}")]
    InvalidState {
        member_id: MemberId,
        state: MemberState,
        expected: MemberState,
    },

    #[error("{started} members launching or running, limit {limit}")]
    OverCapacity { started: usize, limit: usize },
}

// =============================================================================
// Members
// =============================================================================

/// Lifecycle state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Requested,
    Launching,
    Running,
    Unhealthy,
    Removed,
    Failed,
}

impl MemberState {
    /// Counts toward the desired member count.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Requested | Self::Launching | Self::Running)
    }

    /// Accepted or launched, not yet confirmed running.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Requested | Self::Launching)
    }

    /// No longer managed. Events for these members never change them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::Failed)
    }

    /// A task exists (or may exist) on a host.
    pub fn has_task(&self) -> bool {
        matches!(self, Self::Launching | Self::Running | Self::Unhealthy)
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Removed => "removed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a member enters the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapRole {
    /// First member of a generation; starts a new cluster.
    Seed,
    /// Joins the running members.
    Join,
}

/// One managed member process.
#[derive(Debug, Clone, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub generation: Generation,
    pub host: HostId,
    pub hostname: String,
    pub ports: MemberPorts,
    pub offer_id: OfferId,
    pub role: BootstrapRole,
    pub state: MemberState,
    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub task_gone: bool,
    #[serde(skip)]
    pub last_healthy: Option<Instant>,
    #[serde(skip)]
    pub last_status: Option<Instant>,
    #[serde(skip)]
    pub unhealthy_since: Option<Instant>,
}

impl Member {
    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(self.id, self.generation)
    }

    /// Client address other members and probes use.
    pub fn client_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.ports.client)
    }

    /// Peer address members replicate over.
    pub fn peer_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.ports.peer)
    }

    pub fn to_record(&self) -> MemberRecord {
        MemberRecord {
            member_id: self.id,
            generation: self.generation,
            host: self.host.clone(),
            hostname: self.hostname.clone(),
            ports: self.ports,
            offer_id: self.offer_id.clone(),
            role: self.role,
            launched_at: self.launched_at,
        }
    }

    fn healthy_within(&self, now: Instant, window: Duration) -> bool {
        self.last_healthy
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }
}

/// Checkpointed form of a launched member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: MemberId,
    pub generation: Generation,
    pub host: HostId,
    pub hostname: String,
    pub ports: MemberPorts,
    pub offer_id: OfferId,
    pub role: BootstrapRole,
    pub launched_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Results
// =============================================================================

/// Side effects to run once the registry lock is released.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    /// Tasks to kill through the driver.
    pub kill: Vec<TaskHandle>,
    /// Members whose checkpoint record should be deleted.
    pub forget: Vec<MemberId>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.kill.is_empty() && self.forget.is_empty()
    }

    fn remove(&mut self, member: &Member) {
        if !member.task_gone && member.state.has_task() {
            self.kill.push(member.handle());
        }
        self.forget.push(member.id);
    }
}

/// A launch the matcher admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedLaunch {
    pub member_id: MemberId,
    pub generation: Generation,
    pub offer: Offer,
    pub ports: MemberPorts,
    pub role: BootstrapRole,
}

/// Result of deciding an offer batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferDecision {
    pub launches: Vec<PlannedLaunch>,
    pub declined: Vec<DeclinedOffer>,
}

/// What the launcher needs to issue a launch.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub member: Member,
    /// Peer URLs of the current generation's running members, keyed by member.
    pub peers: Vec<(MemberId, String)>,
}

/// Why a status event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    StaleGeneration,
    UnknownMember,
    AlreadyRemoved,
    /// A probe cannot revive a member whose task the manager reported gone.
    TaskGone,
}

/// What a status event did to its member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Discarded(Discard),
    Unchanged,
    /// Reached `Running` for the first time.
    Started { seed: bool },
    /// Came back from `Unhealthy`.
    Recovered,
    /// Health timestamp refreshed.
    Refreshed,
    Unhealthy,
    /// Revived while the cluster was already one over desired.
    Removed,
}

/// The mutations a reseed made.
#[derive(Debug, Clone, PartialEq)]
pub struct ReseedPlan {
    pub previous: Generation,
    pub generation: Generation,
    pub removed: Vec<MemberId>,
    pub effects: Effects,
}

/// Member counts for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemberCounts {
    pub requested: usize,
    pub launching: usize,
    pub running: usize,
    pub unhealthy: usize,
    pub removed: usize,
    pub failed: usize,
}

impl MemberCounts {
    pub fn active(&self) -> usize {
        self.requested + self.launching + self.running
    }

    pub fn in_flight(&self) -> usize {
        self.requested + self.launching
    }
}

/// Serializable view of the registry.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub generation: Generation,
    pub desired: usize,
    pub desired_effective: usize,
    pub seed_pending: bool,
    pub outstanding_intents: usize,
    pub counts: MemberCounts,
    pub members: Vec<Member>,
}

/// Where a health probe should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub handle: TaskHandle,
    pub host: HostId,
    pub hostname: String,
    pub client_port: u16,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
struct RegistryState {
    generation: Generation,
    members: BTreeMap<MemberId, Member>,
    intents: usize,
    seed_pending: bool,
}

impl RegistryState {
    fn current(&self) -> impl Iterator<Item = &Member> {
        let generation = self.generation;
        self.members
            .values()
            .filter(move |m| m.generation == generation)
    }

    fn counts(&self) -> MemberCounts {
        let mut counts = MemberCounts::default();
        for member in self.current() {
            match member.state {
                MemberState::Requested => counts.requested += 1,
                MemberState::Launching => counts.launching += 1,
                MemberState::Running => counts.running += 1,
                MemberState::Unhealthy => counts.unhealthy += 1,
                MemberState::Removed => counts.removed += 1,
                MemberState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    fn desired_effective(&self, desired: usize) -> usize {
        if self.seed_pending {
            1
        } else {
            desired
        }
    }

    /// A new member seeds the cluster when no current member holds data.
    fn next_role(&self) -> BootstrapRole {
        let has_peers = self
            .current()
            .any(|m| matches!(m.state, MemberState::Launching | MemberState::Running | MemberState::Unhealthy));
        if self.seed_pending || !has_peers {
            BootstrapRole::Seed
        } else {
            BootstrapRole::Join
        }
    }

    /// Drop every `Removed` and `Failed` record.
    fn purge_terminal(&mut self) -> usize {
        let before = self.members.len();
        self.members.retain(|_, m| !m.state.is_terminal());
        before - self.members.len()
    }

    /// Drop `Failed` records. They never reached the manager and hold no
    /// checkpoint.
    fn purge_failed(&mut self) -> usize {
        let before = self.members.len();
        self.members.retain(|_, m| m.state != MemberState::Failed);
        before - self.members.len()
    }

    fn started(&self) -> usize {
        let counts = self.counts();
        counts.launching + counts.running
    }
}

/// In-memory authoritative record of members.
pub struct MemberRegistry {
    desired: usize,
    one_per_host: bool,
    requirements: MemberRequirements,
    gate: LaunchGate,
    state: RwLock<RegistryState>,
    generation_tx: watch::Sender<Generation>,
}

impl MemberRegistry {
    /// Create an empty registry at generation 1.
    pub fn new(desired: usize, one_per_host: bool, requirements: MemberRequirements) -> Self {
        let (generation_tx, _) = watch::channel(1);
        Self {
            desired,
            one_per_host,
            requirements,
            gate: LaunchGate::default(),
            state: RwLock::new(RegistryState {
                generation: 1,
                members: BTreeMap::new(),
                intents: 0,
                seed_pending: false,
            }),
            generation_tx,
        }
    }

    pub fn desired(&self) -> usize {
        self.desired
    }

    /// Resume from a checkpoint.
    ///
    /// Restored members of the checkpointed generation start in `Launching`
    /// until task reconciliation reports them; records of older generations
    /// are dropped.
    pub async fn restore(&self, generation: Generation, records: Vec<MemberRecord>, now: Instant) {
        let mut state = self.state.write().await;
        state.generation = generation.max(1);
        state.members.clear();
        for record in records {
            if record.generation != state.generation {
                continue;
            }
            state.members.insert(
                record.member_id,
                Member {
                    id: record.member_id,
                    generation: record.generation,
                    host: record.host,
                    hostname: record.hostname,
                    ports: record.ports,
                    offer_id: record.offer_id,
                    role: record.role,
                    state: MemberState::Launching,
                    created_at: record.launched_at.unwrap_or_else(Utc::now),
                    launched_at: record.launched_at,
                    consecutive_failures: 0,
                    task_gone: false,
                    last_healthy: None,
                    last_status: Some(now),
                    unhealthy_since: None,
                },
            );
        }
        info!(
            generation = state.generation,
            members = state.members.len(),
            "Restored membership checkpoint"
        );
        self.generation_tx.send_replace(state.generation);
    }

    pub async fn generation(&self) -> Generation {
        self.state.read().await.generation
    }

    /// Receiver that changes whenever the generation does.
    pub fn subscribe_generation(&self) -> watch::Receiver<Generation> {
        self.generation_tx.subscribe()
    }

    pub async fn counts(&self) -> MemberCounts {
        self.state.read().await.counts()
    }

    pub async fn outstanding_intents(&self) -> usize {
        self.state.read().await.intents
    }

    pub async fn seed_pending(&self) -> bool {
        self.state.read().await.seed_pending
    }

    pub async fn member(&self, id: &MemberId) -> Option<Member> {
        self.state.read().await.members.get(id).cloned()
    }

    pub async fn members(&self) -> Vec<Member> {
        self.state.read().await.members.values().cloned().collect()
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read().await;
        RegistrySnapshot {
            generation: state.generation,
            desired: self.desired,
            desired_effective: state.desired_effective(self.desired),
            seed_pending: state.seed_pending,
            outstanding_intents: state.intents,
            counts: state.counts(),
            members: state.members.values().cloned().collect(),
        }
    }

    /// Handles of live tasks in the current generation, for reconciliation.
    pub async fn task_handles(&self) -> Vec<TaskHandle> {
        let state = self.state.read().await;
        state
            .current()
            .filter(|m| m.state.has_task() && !m.task_gone)
            .map(Member::handle)
            .collect()
    }

    /// Members the health monitor should probe.
    pub async fn probe_targets(&self) -> Vec<ProbeTarget> {
        let state = self.state.read().await;
        state
            .current()
            .filter(|m| matches!(m.state, MemberState::Running | MemberState::Unhealthy))
            .filter(|m| !m.task_gone)
            .map(|m| ProbeTarget {
                handle: m.handle(),
                host: m.host.clone(),
                hostname: m.hostname.clone(),
                client_port: m.ports.client,
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Offers and launches
    // -------------------------------------------------------------------------

    /// Decide an offer batch and create a `Requested` member per accepted offer.
    pub async fn match_offers(
        &self,
        offers: Vec<Offer>,
        launcher_busy: bool,
        accepting: bool,
    ) -> OfferDecision {
        let mut state = self.state.write().await;
        let purged = state.purge_failed();
        if purged > 0 {
            debug!(purged, "Purged failed members");
        }

        let claimed: HashSet<OfferId> = state
            .members
            .values()
            .filter(|m| m.state.is_in_flight())
            .map(|m| m.offer_id.clone())
            .collect();

        if !accepting {
            let declined = offers
                .into_iter()
                .filter(|o| !claimed.contains(&o.id))
                .map(|o| DeclinedOffer {
                    offer_id: o.id,
                    host: o.host,
                    reason: DeclineReason::ShuttingDown,
                })
                .collect();
            return OfferDecision {
                launches: Vec::new(),
                declined,
            };
        }

        let occupied: HashSet<HostId> = state
            .current()
            .filter(|m| !m.state.is_terminal())
            .map(|m| m.host.clone())
            .collect();
        let counts = state.counts();
        let view = MatchView {
            desired: state.desired_effective(self.desired),
            active: counts.active(),
            in_flight: counts.in_flight(),
            launcher_busy,
            occupied_hosts: &occupied,
            claimed_offers: &claimed,
            one_per_host: self.one_per_host,
            requirements: &self.requirements,
            gate: &self.gate,
        };
        let outcome = match_offers(offers, &view);

        for offer_id in &outcome.redelivered {
            debug!(offer_id = %offer_id, "Ignoring re-delivered offer");
        }

        let mut launches = Vec::with_capacity(outcome.accepted.len());
        for accepted in outcome.accepted {
            let role = state.next_role();
            let member = Member {
                id: MemberId::new(),
                generation: state.generation,
                host: accepted.offer.host.clone(),
                hostname: accepted.offer.hostname.clone(),
                ports: accepted.ports,
                offer_id: accepted.offer.id.clone(),
                role,
                state: MemberState::Requested,
                created_at: Utc::now(),
                launched_at: None,
                consecutive_failures: 0,
                task_gone: false,
                last_healthy: None,
                last_status: None,
                unhealthy_since: None,
            };
            info!(
                member_id = %member.id,
                generation = member.generation,
                offer_id = %member.offer_id,
                host = %member.host,
                role = ?role,
                "Accepted offer"
            );
            state.intents = state.intents.saturating_sub(1);
            launches.push(PlannedLaunch {
                member_id: member.id,
                generation: member.generation,
                offer: accepted.offer,
                ports: accepted.ports,
                role,
            });
            state.members.insert(member.id, member);
        }

        OfferDecision {
            launches,
            declined: outcome.declined,
        }
    }

    /// `Requested → Launching`, returning what the launch needs.
    pub async fn begin_launch(
        &self,
        member_id: MemberId,
        generation: Generation,
        now: Instant,
    ) -> Result<LaunchContext, RegistryError> {
        let mut state = self.state.write().await;
        if generation != state.generation {
            return Err(RegistryError::StaleGeneration {
                requested: generation,
                current: state.generation,
            });
        }

        let peers: Vec<(MemberId, String)> = state
            .current()
            .filter(|m| m.state == MemberState::Running && m.id != member_id)
            .map(|m| (m.id, m.peer_url()))
            .collect();

        let started = state.started();
        let limit = state.desired_effective(self.desired) + 1;

        let member = state
            .members
            .get_mut(&member_id)
            .ok_or(RegistryError::UnknownMember(member_id))?;
        if member.state != MemberState::Requested {
            return Err(RegistryError::InvalidState {
                member_id,
                state: member.state,
                expected: MemberState::Requested,
            });
        }
        if started >= limit {
            member.state = MemberState::Failed;
            return Err(RegistryError::OverCapacity { started, limit });
        }

        member.state = MemberState::Launching;
        member.launched_at = Some(Utc::now());
        member.last_status = Some(now);

        Ok(LaunchContext {
            member: member.clone(),
            peers,
        })
    }

    /// Whether a launched member is still wanted: current generation and
    /// not removed while its launch was in progress.
    pub async fn launched(&self, member_id: MemberId, generation: Generation) -> bool {
        let state = self.state.read().await;
        generation == state.generation
            && state
                .members
                .get(&member_id)
                .is_some_and(|m| m.state.has_task())
    }

    /// Roll a member that never reached the manager back to `Failed`.
    pub async fn rollback_launch(&self, member_id: MemberId) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let member = state
            .members
            .get_mut(&member_id)
            .ok_or(RegistryError::UnknownMember(member_id))?;
        if member.state.is_terminal() {
            return Ok(());
        }
        warn!(member_id = %member_id, from = %member.state, "Rolling back launch");
        member.state = MemberState::Failed;
        Ok(())
    }

    /// The manager withdrew an offer: a pending member holding it fails.
    pub async fn offer_rescinded(&self, offer_id: &OfferId) -> Option<MemberId> {
        let mut state = self.state.write().await;
        let member = state
            .members
            .values_mut()
            .find(|m| m.state == MemberState::Requested && &m.offer_id == offer_id)?;
        member.state = MemberState::Failed;
        info!(member_id = %member.id, offer_id = %offer_id, "Offer rescinded before launch");
        Some(member.id)
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Apply one classified status observation.
    pub async fn apply_status(
        &self,
        handle: TaskHandle,
        class: StatusClass,
        source: StatusSource,
        now: Instant,
    ) -> (StatusOutcome, Effects) {
        let mut state = self.state.write().await;
        let mut effects = Effects::default();
        let alive = matches!(class, StatusClass::Pending | StatusClass::Healthy);

        if handle.generation() != state.generation {
            if alive && source == StatusSource::Manager && handle.generation() < state.generation {
                effects.kill.push(handle);
            }
            return (StatusOutcome::Discarded(Discard::StaleGeneration), effects);
        }

        let desired_effective = state.desired_effective(self.desired);
        let launching_running = state.started();

        let Some(member) = state.members.get_mut(&handle.member_id()) else {
            return (StatusOutcome::Discarded(Discard::UnknownMember), effects);
        };

        if member.state.is_terminal() {
            if alive && source == StatusSource::Manager {
                effects.kill.push(handle);
            }
            return (StatusOutcome::Discarded(Discard::AlreadyRemoved), effects);
        }

        match class {
            StatusClass::Pending => {
                member.last_status = Some(now);
                (StatusOutcome::Unchanged, effects)
            }
            StatusClass::Healthy => {
                if member.task_gone && source == StatusSource::Probe {
                    return (StatusOutcome::Discarded(Discard::TaskGone), effects);
                }
                let previous = member.state;
                member.last_status = Some(now);
                member.last_healthy = Some(now);
                member.consecutive_failures = 0;
                if source == StatusSource::Manager {
                    member.task_gone = false;
                }

                match previous {
                    MemberState::Requested => (StatusOutcome::Unchanged, effects),
                    MemberState::Running => (StatusOutcome::Refreshed, effects),
                    MemberState::Unhealthy => {
                        if launching_running > desired_effective {
                            effects.remove(member);
                            member.state = MemberState::Removed;
                            info!(
                                member_id = %member.id,
                                "Member recovered after being replaced, removing"
                            );
                            return (StatusOutcome::Removed, effects);
                        }
                        member.state = MemberState::Running;
                        member.unhealthy_since = None;
                        info!(member_id = %member.id, "Member recovered");
                        (StatusOutcome::Recovered, effects)
                    }
                    MemberState::Launching => {
                        member.state = MemberState::Running;
                        let member_id = member.id;
                        let is_seed = member.role == BootstrapRole::Seed;
                        info!(member_id = %member_id, generation = handle.generation(), "Member running");

                        let superseded = state
                            .current()
                            .filter(|m| m.state == MemberState::Unhealthy)
                            .min_by_key(|m| m.unhealthy_since)
                            .map(|m| m.id);
                        if let Some(old) = superseded.and_then(|id| state.members.get_mut(&id)) {
                            effects.remove(old);
                            old.state = MemberState::Removed;
                            info!(member_id = %old.id, replaced_by = %member_id, "Superseded unhealthy member");
                        }
                        let purged = state.purge_terminal();
                        if purged > 0 {
                            debug!(purged, "Purged removed members");
                        }

                        let seed = is_seed && state.seed_pending;
                        if seed {
                            state.seed_pending = false;
                        }
                        (StatusOutcome::Started { seed }, effects)
                    }
                    MemberState::Removed | MemberState::Failed => {
                        (StatusOutcome::Discarded(Discard::AlreadyRemoved), effects)
                    }
                }
            }
            StatusClass::Degraded | StatusClass::Terminal => {
                member.consecutive_failures += 1;
                member.last_status = Some(now);
                if class == StatusClass::Terminal {
                    member.task_gone = true;
                }
                match member.state {
                    MemberState::Running | MemberState::Launching => {
                        member.state = MemberState::Unhealthy;
                        member.unhealthy_since = Some(now);
                        warn!(
                            member_id = %member.id,
                            failures = member.consecutive_failures,
                            task_gone = member.task_gone,
                            "Member unhealthy"
                        );
                        (StatusOutcome::Unhealthy, effects)
                    }
                    MemberState::Requested if class == StatusClass::Terminal => {
                        member.state = MemberState::Failed;
                        (StatusOutcome::Removed, effects)
                    }
                    _ => (StatusOutcome::Unchanged, effects),
                }
            }
        }
    }

    /// Every member on a lost host loses its task.
    pub async fn agent_lost(&self, host: &HostId, now: Instant) -> Vec<MemberId> {
        let mut state = self.state.write().await;
        let generation = state.generation;
        let mut affected = Vec::new();
        for member in state.members.values_mut() {
            if member.generation != generation || &member.host != host || !member.state.has_task() {
                continue;
            }
            member.task_gone = true;
            member.consecutive_failures += 1;
            if member.state != MemberState::Unhealthy {
                member.state = MemberState::Unhealthy;
                member.unhealthy_since = Some(now);
            }
            affected.push(member.id);
        }
        affected
    }

    /// Time out unhealthy and silent members.
    pub async fn expire(&self, now: Instant, grace: Duration, launch_timeout: Duration) -> Effects {
        let mut state = self.state.write().await;
        let mut effects = Effects::default();
        let purged = state.purge_failed();
        if purged > 0 {
            debug!(purged, "Purged failed members");
        }
        for member in state.members.values_mut() {
            match member.state {
                MemberState::Unhealthy => {
                    let since = member.unhealthy_since.unwrap_or(now);
                    if now.saturating_duration_since(since) >= grace {
                        info!(member_id = %member.id, "Removing member after grace period");
                        effects.remove(member);
                        member.state = MemberState::Removed;
                    }
                }
                MemberState::Launching => {
                    let since = member.last_status.unwrap_or(now);
                    if now.saturating_duration_since(since) >= launch_timeout {
                        warn!(member_id = %member.id, "No status since launch, marking unhealthy");
                        member.state = MemberState::Unhealthy;
                        member.unhealthy_since = Some(now);
                    }
                }
                _ => {}
            }
        }
        effects
    }

    // -------------------------------------------------------------------------
    // Convergence
    // -------------------------------------------------------------------------

    /// Healthy current-generation members measured against quorum of desired.
    pub async fn quorum_reading(&self, now: Instant, window: Duration) -> QuorumReading {
        let state = self.state.read().await;
        let healthy = state
            .current()
            .filter(|m| m.state == MemberState::Running && m.healthy_within(now, window))
            .count();
        QuorumReading::new(healthy, self.desired)
    }

    /// Record launch intents for the gap to the desired size.
    ///
    /// Returns the number of intents added. Repeated calls never raise the
    /// outstanding intents above the gap.
    pub async fn request_launches(&self) -> usize {
        let mut state = self.state.write().await;
        let active = state.counts().active();
        let desired = state.desired_effective(self.desired);
        let gap = launch_gap(desired, active, state.intents);
        state.intents += gap;
        gap
    }

    /// Remove every current member and start a new generation.
    pub async fn begin_reseed(&self) -> ReseedPlan {
        let mut state = self.state.write().await;
        let previous = state.generation;
        let mut effects = Effects::default();
        let mut removed = Vec::new();

        for member in state.members.values_mut() {
            if member.generation != previous || member.state.is_terminal() {
                continue;
            }
            if member.state == MemberState::Requested {
                member.state = MemberState::Failed;
                continue;
            }
            effects.remove(member);
            member.state = MemberState::Removed;
            removed.push(member.id);
        }

        state.generation = previous + 1;
        state.intents = 1;
        state.seed_pending = true;
        self.generation_tx.send_replace(state.generation);

        warn!(
            previous,
            generation = state.generation,
            removed = removed.len(),
            "Reseeding cluster"
        );

        ReseedPlan {
            previous,
            generation: state.generation,
            removed,
            effects,
        }
    }
}
