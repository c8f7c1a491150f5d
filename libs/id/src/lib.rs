//! # seedkeeper-id
//!
//! Identifier types shared by the seedkeeper scheduler.
//!
//! ## Design Principles
//!
//! - Member IDs are generated by the scheduler and never reused
//! - Identifiers handed out by the cluster manager (offers, hosts, the
//!   framework session) are opaque strings and are never parsed
//! - Task handles bind a member to the cluster generation that launched it,
//!   so status updates from an older generation can be recognized and dropped
//!
//! ## ID Format
//!
//! Scheduler-generated IDs use a prefixed format: `{prefix}_{ulid}`.
//! Task handles append the generation: `{member_id}.g{generation}`.
//!
//! Examples:
//! - `member_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `member_01HV4Z2WQXKJNM8GPQY6VBKC3D.g3`

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
