//! Coordination store client.
//!
//! The scheduler keeps a small amount of state outside its own process: the
//! framework session ID the cluster manager assigned it, and a checkpoint of
//! the cluster generation and launched members. Both live in a hierarchical
//! key space under `{chroot}/{cluster}`.

mod membership;
mod memory;
mod session;
mod sqlite;

pub use membership::MembershipCheckpoint;
pub use memory::MemoryStore;
pub use session::SessionIdentity;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::PersistUri;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid path '{0}': must be absolute without a trailing slash")]
    InvalidPath(String),

    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("store worker failed: {0}")]
    Worker(String),
}

/// A hierarchical key-value store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Value at `path`, `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError>;

    /// Create or overwrite the value at `path`.
    async fn set(&self, path: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `path`. Deleting a missing path succeeds.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Names of the direct children of `path`.
    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;
}

/// Open the store named by the persistence URI.
pub fn open(uri: &PersistUri) -> Result<Arc<dyn CoordinationStore>, StoreError> {
    match uri {
        PersistUri::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?)),
        PersistUri::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Join a root and a relative path.
pub(crate) fn join(root: &str, child: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), child.trim_start_matches('/'))
}

/// Split an absolute path into (parent, name).
pub(crate) fn split(path: &str) -> Result<(&str, &str), StoreError> {
    if !path.starts_with('/') || path.ends_with('/') || path.len() < 2 {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    match path.rsplit_once('/') {
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
        None => Err(StoreError::InvalidPath(path.to_string())),
    }
}
