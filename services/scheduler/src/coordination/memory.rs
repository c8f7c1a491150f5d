//! In-memory coordination store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{split, CoordinationStore, StoreError};

/// Volatile store for tests and `--test-mode`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<String>, StoreError> {
        split(path)?;
        Ok(self.entries.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, value: &str) -> Result<(), StoreError> {
        split(path)?;
        self.entries
            .write()
            .await
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        split(path)?;
        self.entries.write().await.remove(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.read().await;
        let mut names = Vec::new();
        for key in entries.keys() {
            let (parent, name) = split(key)?;
            if parent == path {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("/sk/a").await.unwrap(), None);

        store.set("/sk/a", "1").await.unwrap();
        store.set("/sk/a", "2").await.unwrap();
        assert_eq!(store.get("/sk/a").await.unwrap().as_deref(), Some("2"));

        store.delete("/sk/a").await.unwrap();
        store.delete("/sk/a").await.unwrap();
        assert_eq!(store.get("/sk/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_children_are_direct_only() {
        let store = MemoryStore::new();
        store.set("/sk/c/members/m1", "x").await.unwrap();
        store.set("/sk/c/members/m2", "y").await.unwrap();
        store.set("/sk/c/generation", "1").await.unwrap();

        let mut children = store.children("/sk/c/members").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["m1", "m2"]);
        assert_eq!(store.children("/sk/c").await.unwrap(), vec!["generation"]);
    }

    #[tokio::test]
    async fn test_rejects_relative_path() {
        let store = MemoryStore::new();
        let err = store.set("sk/a", "1").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath(_)));
    }
}
