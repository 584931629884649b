use async_trait::async_trait;
use goalflow_core::{CoreError, FlowId, SnapshotKey, SnapshotStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Blob store keeping snapshots in a shared map
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<SnapshotKey, Vec<u8>>>>,
}

impl InMemorySnapshotStore {
    /// Create a new, empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots across all namespaces
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), CoreError> {
        debug!(key = %key, bytes = data.len(), "Saving snapshot");
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(key.clone(), data);
        Ok(())
    }

    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(key).cloned())
    }

    async fn delete(&self, key: &SnapshotKey) -> Result<(), CoreError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(key);
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<FlowId>, CoreError> {
        let snapshots = self.snapshots.read().await;
        let mut ids: Vec<FlowId> = snapshots
            .keys()
            .filter(|key| key.namespace == namespace)
            .map(|key| key.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(namespace: &str, id: &str) -> SnapshotKey {
        SnapshotKey::new(namespace, &FlowId::from(id))
    }

    #[tokio::test]
    async fn test_save_load_delete() -> Result<(), CoreError> {
        let store = InMemorySnapshotStore::new();
        store.save(&key("ns", "f1"), b"one".to_vec()).await?;
        store.save(&key("ns", "f1"), b"two".to_vec()).await?;

        assert_eq!(store.load(&key("ns", "f1")).await?, Some(b"two".to_vec()));
        assert_eq!(store.load(&key("other", "f1")).await?, None);
        assert_eq!(store.len().await, 1);

        store.delete(&key("ns", "f1")).await?;
        assert_eq!(store.load(&key("ns", "f1")).await?, None);
        // Deleting again is fine
        store.delete(&key("ns", "f1")).await?;
        assert!(store.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_namespace() -> Result<(), CoreError> {
        let store = InMemorySnapshotStore::new();
        store.save(&key("a", "f2"), vec![]).await?;
        store.save(&key("a", "f1"), vec![]).await?;
        store.save(&key("b", "f3"), vec![]).await?;

        assert_eq!(
            store.list("a").await?,
            vec![FlowId::from("f1"), FlowId::from("f2")]
        );
        assert!(store.list("c").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_clones_share_storage() -> Result<(), CoreError> {
        let store = InMemorySnapshotStore::new();
        let clone = store.clone();
        clone.save(&key("ns", "f"), b"x".to_vec()).await?;
        assert_eq!(store.load(&key("ns", "f")).await?, Some(b"x".to_vec()));
        Ok(())
    }
}
