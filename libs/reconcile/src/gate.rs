//! Launch admission.
//!
//! Members are added one at a time: a new member must have joined and the
//! existing members must have caught up before the next launch starts.

/// Gate deciding how many launches may be admitted right now.
#[derive(Debug, Clone)]
pub struct LaunchGate {
    /// Maximum launches that may be in flight at once.
    pub max_in_flight: usize,
}

impl Default for LaunchGate {
    fn default() -> Self {
        Self { max_in_flight: 1 }
    }
}

impl LaunchGate {
    /// Launch slots available.
    ///
    /// `in_flight` counts members accepted or launched but not yet running.
    /// A busy launcher (still inside its convergence delay) admits nothing.
    pub fn slots(&self, in_flight: usize, launcher_busy: bool) -> usize {
        if launcher_busy {
            return 0;
        }
        self.max_in_flight.saturating_sub(in_flight)
    }

    /// Offers that may be accepted in one batch.
    pub fn admissible(&self, desired: usize, active: usize, in_flight: usize, launcher_busy: bool) -> usize {
        desired
            .saturating_sub(active)
            .min(self.slots(in_flight, launcher_busy))
    }
}

/// Members still missing once outstanding launch intents are counted.
pub fn launch_gap(desired: usize, active: usize, outstanding_intents: usize) -> usize {
    desired.saturating_sub(active).saturating_sub(outstanding_intents)
}
