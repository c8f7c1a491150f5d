//! Top-level error type.

use thiserror::Error;

use crate::artifacts::ArtifactError;
use crate::config::ConfigError;
use crate::coordination::StoreError;
use crate::driver::DriverError;
use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
