//! Convergence primitives for the seedkeeper scheduler.
//!
//! Everything here is pure: callers pass in counts and instants, and get
//! decisions back. The scheduler service owns the clocks, the locks and the
//! side effects.
//!
//! - [`quorum`]: how many healthy members the managed store needs.
//! - [`gate`]: how many launches may start right now, and how large the gap
//!   to the desired size is.
//! - [`livelock`]: the `Healthy → Degraded → Livelocked → Reseeding` state
//!   machine driven by quorum readings.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - At most one launch is ever admitted while another is in flight
//! - Only a continuous run of quorum-less readings reaches `Livelocked`

pub mod gate;
pub mod livelock;
pub mod quorum;

pub use gate::{launch_gap, LaunchGate};
pub use livelock::{ClusterPhase, LivelockDetector, PhaseChange};
pub use quorum::{quorum_size, QuorumReading};
