//! seedkeeper scheduler
//!
//! Runs a key-value store cluster on an offer-based cluster manager and
//! keeps it healthy:
//!
//! - Resource offers are matched against the desired member count, one
//!   member per host ([`offers`], [`registry`])
//! - Members are launched strictly one at a time with a convergence pause
//!   between launches ([`launcher`])
//! - Missing members are requested on a timer ([`requestor`])
//! - Status updates and health probes drive each member's lifecycle
//!   ([`status`], [`health`])
//! - A cluster without quorum for too long is reseeded from a single
//!   member in a new generation ([`reseed`])
//! - The framework session and membership survive restarts through a
//!   coordination store ([`coordination`])

pub mod admin;
pub mod artifacts;
pub mod config;
pub mod coordination;
pub mod driver;
pub mod error;
pub mod health;
pub mod launcher;
pub mod offers;
pub mod orchestrator;
pub mod registry;
pub mod requestor;
pub mod reseed;
pub mod scheduler;
pub mod status;

pub use error::{Result, SchedulerError};
