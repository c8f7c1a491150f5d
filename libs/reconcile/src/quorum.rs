//! Quorum math.
//!
//! Quorum is a strict majority of the *desired* member count, not of the
//! members currently registered. During a partial scale-up this is the
//! conservative choice: two healthy members out of a desired five never
//! count as available.

use serde::Serialize;

/// Minimum healthy members for a cluster of `desired` members.
pub fn quorum_size(desired: usize) -> usize {
    desired / 2 + 1
}

/// One observation of cluster health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumReading {
    /// Members that reported healthy within the health window.
    pub healthy: usize,

    /// Members required for quorum.
    pub required: usize,
}

impl QuorumReading {
    pub fn new(healthy: usize, desired: usize) -> Self {
        Self {
            healthy,
            required: quorum_size(desired),
        }
    }

    pub fn has_quorum(&self) -> bool {
        self.healthy >= self.required
    }
}
