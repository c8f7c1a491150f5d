//! Framework session identity.
//!
//! The cluster manager hands the scheduler a framework ID on first
//! registration. Re-registering with the same ID after a restart lets the
//! scheduler adopt the tasks it launched earlier instead of orphaning them.

use std::sync::Arc;

use seedkeeper_id::FrameworkId;
use tracing::info;

use super::{join, CoordinationStore, StoreError};

/// Reads and persists the framework ID for one cluster.
#[derive(Clone)]
pub struct SessionIdentity {
    store: Arc<dyn CoordinationStore>,
    path: String,
}

impl SessionIdentity {
    /// Identity stored at `{chroot}/{cluster}/framework_id`.
    pub fn new(store: Arc<dyn CoordinationStore>, chroot: &str, cluster: &str) -> Self {
        Self {
            store,
            path: join(&join(chroot, cluster), "framework_id"),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The framework ID from a previous run, if any.
    pub async fn previous_framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        Ok(self
            .store
            .get(&self.path)
            .await?
            .filter(|id| !id.is_empty())
            .map(FrameworkId::new))
    }

    /// Persist `id` if it differs from the stored one. Returns whether a write happened.
    pub async fn persist_framework_id(&self, id: &FrameworkId) -> Result<bool, StoreError> {
        if self.previous_framework_id().await?.as_ref() == Some(id) {
            return Ok(false);
        }
        self.store.set(&self.path, id.as_str()).await?;
        info!(framework_id = %id, path = %self.path, "Persisted framework ID");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;

    #[tokio::test]
    async fn test_persist_on_first_registration() {
        let identity = SessionIdentity::new(Arc::new(MemoryStore::new()), "/seedkeeper", "prod");
        assert_eq!(identity.path(), "/seedkeeper/prod/framework_id");
        assert_eq!(identity.previous_framework_id().await.unwrap(), None);

        let id = FrameworkId::new("fw-0001");
        assert!(identity.persist_framework_id(&id).await.unwrap());
        assert!(!identity.persist_framework_id(&id).await.unwrap());
        assert_eq!(identity.previous_framework_id().await.unwrap(), Some(id));

        let replaced = FrameworkId::new("fw-0002");
        assert!(identity.persist_framework_id(&replaced).await.unwrap());
        assert_eq!(
            identity.previous_framework_id().await.unwrap(),
            Some(replaced)
        );
    }
}
