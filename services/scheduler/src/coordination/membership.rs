//! Cluster membership checkpoint.
//!
//! ```text
//! {chroot}/{cluster}/generation          current generation
//! {chroot}/{cluster}/members/{member_id} one JSON MemberRecord per launched member
//! ```

use std::sync::Arc;

use seedkeeper_id::{Generation, MemberId};
use tracing::warn;

use super::{join, CoordinationStore, StoreError};
use crate::registry::MemberRecord;

#[derive(Clone)]
pub struct MembershipCheckpoint {
    store: Arc<dyn CoordinationStore>,
    root: String,
}

impl MembershipCheckpoint {
    pub fn new(store: Arc<dyn CoordinationStore>, chroot: &str, cluster: &str) -> Self {
        Self {
            store,
            root: join(chroot, cluster),
        }
    }

    fn generation_path(&self) -> String {
        join(&self.root, "generation")
    }

    fn members_path(&self) -> String {
        join(&self.root, "members")
    }

    pub async fn load_generation(&self) -> Result<Option<Generation>, StoreError> {
        let path = self.generation_path();
        match self.store.get(&path).await? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<Generation>()
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    path,
                    reason: e.to_string(),
                }),
        }
    }

    pub async fn save_generation(&self, generation: Generation) -> Result<(), StoreError> {
        self.store
            .set(&self.generation_path(), &generation.to_string())
            .await
    }

    /// Every readable member record. Corrupt records are skipped.
    pub async fn load_members(&self) -> Result<Vec<MemberRecord>, StoreError> {
        let root = self.members_path();
        let mut records = Vec::new();
        for name in self.store.children(&root).await? {
            let path = join(&root, &name);
            let Some(raw) = self.store.get(&path).await? else {
                continue;
            };
            match serde_json::from_str::<MemberRecord>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path, error = %e, "Skipping corrupt member record"),
            }
        }
        Ok(records)
    }

    pub async fn save_member(&self, record: &MemberRecord) -> Result<(), StoreError> {
        let path = join(&self.members_path(), &record.member_id.to_string());
        let value = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&path, &value).await
    }

    pub async fn forget(&self, member_id: MemberId) -> Result<(), StoreError> {
        self.store
            .delete(&join(&self.members_path(), &member_id.to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;
    use crate::offers::MemberPorts;
    use crate::registry::BootstrapRole;
    use seedkeeper_id::{HostId, OfferId};

    fn record(generation: Generation) -> MemberRecord {
        MemberRecord {
            member_id: MemberId::new(),
            generation,
            host: HostId::new("h1"),
            hostname: "h1.local".to_string(),
            ports: MemberPorts {
                client: 31000,
                peer: 31001,
                executor: 31002,
            },
            offer_id: OfferId::new("o1"),
            role: BootstrapRole::Seed,
            launched_at: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_generation_and_members() {
        let store = Arc::new(MemoryStore::new());
        let checkpoint = MembershipCheckpoint::new(store.clone(), "/seedkeeper", "prod");
        assert_eq!(checkpoint.load_generation().await.unwrap(), None);

        checkpoint.save_generation(3).await.unwrap();
        assert_eq!(checkpoint.load_generation().await.unwrap(), Some(3));

        let r = record(3);
        checkpoint.save_member(&r).await.unwrap();
        assert_eq!(checkpoint.load_members().await.unwrap(), vec![r.clone()]);

        checkpoint.forget(r.member_id).await.unwrap();
        assert!(checkpoint.load_members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_records() {
        let store = Arc::new(MemoryStore::new());
        let checkpoint = MembershipCheckpoint::new(store.clone(), "/seedkeeper", "prod");

        store
            .set("/seedkeeper/prod/members/garbage", "not json")
            .await
            .unwrap();
        assert!(checkpoint.load_members().await.unwrap().is_empty());

        store.set("/seedkeeper/prod/generation", "two").await.unwrap();
        let err = checkpoint.load_generation().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
