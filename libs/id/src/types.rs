//! Identifier definitions.

use crate::{define_id, define_opaque_id, IdError};

// =============================================================================
// Scheduler-generated
// =============================================================================

define_id!(MemberId, "member");

// =============================================================================
// Manager-assigned
// =============================================================================

define_opaque_id!(OfferId);
define_opaque_id!(HostId);
define_opaque_id!(FrameworkId);

// =============================================================================
// Task Handle
// =============================================================================

/// Cluster generation counter. Starts at 1 and increases on every reseed.
pub type Generation = u64;

/// The task identifier handed to the cluster manager for one member launch.
///
/// A handle ties the member to the generation that launched it. Status
/// updates carry the handle back, which is how updates for members of a
/// discarded generation are told apart from live ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle {
    member_id: MemberId,
    generation: Generation,
}

impl TaskHandle {
    const GENERATION_MARKER: &'static str = ".g";

    #[must_use]
    pub const fn new(member_id: MemberId, generation: Generation) -> Self {
        Self {
            member_id,
            generation,
        }
    }

    #[must_use]
    pub const fn member_id(&self) -> MemberId {
        self.member_id
    }

    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Parses a handle in the format `{member_id}.g{generation}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((member, generation)) = s.rsplit_once(Self::GENERATION_MARKER) else {
            return Err(IdError::MissingGeneration(s.to_string()));
        };

        let member_id = MemberId::parse(member)?;
        let generation = match generation.parse::<Generation>() {
            Ok(g) if g > 0 => g,
            _ => return Err(IdError::InvalidGeneration(generation.to_string())),
        };

        Ok(Self {
            member_id,
            generation,
        })
    }
}

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.member_id,
            Self::GENERATION_MARKER,
            self.generation
        )
    }
}

impl std::str::FromStr for TaskHandle {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for TaskHandle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for TaskHandle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
