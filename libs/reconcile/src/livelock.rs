//! Livelock detection.
//!
//! ## State Machine
//!
//! ```text
//! Healthy -> Degraded -> Livelocked -> Reseeding -> Healthy (next generation)
//!    ^          |            |
//!    +----------+------------+   (any quorum-healthy reading)
//! ```
//!
//! The clock tracks how long the cluster as a whole has been without quorum.
//! Individual members going up and down do not touch it; only a reading that
//! shows quorum does.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::quorum::QuorumReading;

/// Externally visible phase of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterPhase {
    Healthy,
    Degraded,
    Livelocked,
    Reseeding,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Livelocked => "livelocked",
            Self::Reseeding => "reseeding",
        };
        f.write_str(s)
    }
}

/// A phase transition produced by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseChange {
    pub from: ClusterPhase,
    pub to: ClusterPhase,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Healthy,
    Degraded { since: Instant },
    Livelocked { since: Instant },
    Reseeding { generation: u64 },
}

impl State {
    fn phase(&self) -> ClusterPhase {
        match self {
            Self::Healthy => ClusterPhase::Healthy,
            Self::Degraded { .. } => ClusterPhase::Degraded,
            Self::Livelocked { .. } => ClusterPhase::Livelocked,
            Self::Reseeding { .. } => ClusterPhase::Reseeding,
        }
    }
}

/// Tracks how long quorum has been missing.
#[derive(Debug, Clone)]
pub struct LivelockDetector {
    timeout: Duration,
    state: State,
    entered_at: Instant,
}

impl LivelockDetector {
    /// Starts in `Degraded`: nothing has shown quorum yet, so the clock runs
    /// from `now`.
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            state: State::Degraded { since: now },
            entered_at: now,
        }
    }

    pub fn phase(&self) -> ClusterPhase {
        self.state.phase()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the current phase was entered.
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    /// Start of the current quorum-less run, if any.
    pub fn without_quorum_since(&self) -> Option<Instant> {
        match self.state {
            State::Degraded { since } | State::Livelocked { since } => Some(since),
            State::Healthy | State::Reseeding { .. } => None,
        }
    }

    /// Generation being reseeded, while a reseed is in progress.
    pub fn reseeding_generation(&self) -> Option<u64> {
        match self.state {
            State::Reseeding { generation, .. } => Some(generation),
            _ => None,
        }
    }

    /// Feed one quorum reading.
    ///
    /// Readings taken during a reseed are ignored; the reseed ends through
    /// [`LivelockDetector::finish_reseed`].
    pub fn observe(&mut self, reading: QuorumReading, now: Instant) -> Option<PhaseChange> {
        let next = match (self.state, reading.has_quorum()) {
            (State::Reseeding { .. }, _) => return None,
            (State::Healthy, true) => return None,
            (_, true) => State::Healthy,
            (State::Healthy, false) => self.after_loss(now, now),
            (State::Degraded { since }, false) => self.after_loss(since, now),
            (State::Livelocked { .. }, false) => return None,
        };
        self.transition(next, now)
    }

    /// Enter `Reseeding` for the new `generation`.
    pub fn begin_reseed(&mut self, generation: u64, now: Instant) -> Option<PhaseChange> {
        self.transition(State::Reseeding { generation }, now)
    }

    /// The seed of the new generation is up: back to `Healthy`.
    pub fn finish_reseed(&mut self, now: Instant) -> Option<PhaseChange> {
        match self.state {
            State::Reseeding { .. } => self.transition(State::Healthy, now),
            _ => None,
        }
    }

    fn after_loss(&self, since: Instant, now: Instant) -> State {
        if now.saturating_duration_since(since) >= self.timeout {
            State::Livelocked { since }
        } else {
            State::Degraded { since }
        }
    }

    fn transition(&mut self, next: State, now: Instant) -> Option<PhaseChange> {
        let from = self.state.phase();
        let to = next.phase();
        self.state = next;
        if from == to {
            return None;
        }
        self.entered_at = now;
        Some(PhaseChange { from, to })
    }
}
