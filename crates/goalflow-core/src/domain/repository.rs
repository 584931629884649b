//! Persistence seam for flow snapshots
//!
//! The engine serializes a [`FlowContext`](super::flow::FlowContext) after
//! every transition and hands the bytes to a [`SnapshotStore`]. Stores are
//! opaque blob stores keyed by namespace and flow ID; they never interpret
//! the payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CoreError, FlowId};

/// Key under which a snapshot is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub namespace: String,
    pub id: FlowId,
}

impl SnapshotKey {
    pub fn new(namespace: &str, id: &FlowId) -> Self {
        Self {
            namespace: namespace.to_string(),
            id: id.clone(),
        }
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Storage for serialized flow snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store or replace a snapshot
    async fn save(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), CoreError>;

    /// Load a snapshot, `None` when absent
    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError>;

    /// Remove a snapshot; absent keys are not an error
    async fn delete(&self, key: &SnapshotKey) -> Result<(), CoreError>;

    /// IDs of every snapshot in a namespace
    async fn list(&self, namespace: &str) -> Result<Vec<FlowId>, CoreError>;
}

/// Store that keeps nothing, for engines that run without persistence
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSnapshotStore;

#[async_trait]
impl SnapshotStore for NullSnapshotStore {
    async fn save(&self, _key: &SnapshotKey, _data: Vec<u8>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn load(&self, _key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(None)
    }

    async fn delete(&self, _key: &SnapshotKey) -> Result<(), CoreError> {
        Ok(())
    }

    async fn list(&self, _namespace: &str) -> Result<Vec<FlowId>, CoreError> {
        Ok(Vec::new())
    }
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;

    /// Concurrent map backed snapshot store
    #[derive(Debug, Clone, Default)]
    pub struct MemorySnapshotStore {
        snapshots: Arc<DashMap<SnapshotKey, Vec<u8>>>,
    }

    impl MemorySnapshotStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of stored snapshots
        pub fn len(&self) -> usize {
            self.snapshots.len()
        }

        pub fn is_empty(&self) -> bool {
            self.snapshots.is_empty()
        }
    }

    #[async_trait]
    impl SnapshotStore for MemorySnapshotStore {
        async fn save(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), CoreError> {
            self.snapshots.insert(key.clone(), data);
            Ok(())
        }

        async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError> {
            Ok(self.snapshots.get(key).map(|entry| entry.value().clone()))
        }

        async fn delete(&self, key: &SnapshotKey) -> Result<(), CoreError> {
            self.snapshots.remove(key);
            Ok(())
        }

        async fn list(&self, namespace: &str) -> Result<Vec<FlowId>, CoreError> {
            let mut ids: Vec<FlowId> = self
                .snapshots
                .iter()
                .filter(|entry| entry.key().namespace == namespace)
                .map(|entry| entry.key().id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        }
    }
}

#[cfg(all(test, feature = "testing"))]
mod tests {
    use super::memory::MemorySnapshotStore;
    use super::*;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemorySnapshotStore::new();
        let key = SnapshotKey::new("default", &FlowId::from("f1"));

        assert_eq!(store.load(&key).await.unwrap(), None);
        store.save(&key, b"one".to_vec()).await.unwrap();
        store.save(&key, b"two".to_vec()).await.unwrap();
        assert_eq!(store.load(&key).await.unwrap(), Some(b"two".to_vec()));

        store.delete(&key).await.unwrap();
        assert!(store.is_empty());
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_scoped_by_namespace() {
        let store = MemorySnapshotStore::new();
        store
            .save(&SnapshotKey::new("a", &FlowId::from("f2")), vec![])
            .await
            .unwrap();
        store
            .save(&SnapshotKey::new("a", &FlowId::from("f1")), vec![])
            .await
            .unwrap();
        store
            .save(&SnapshotKey::new("b", &FlowId::from("f3")), vec![])
            .await
            .unwrap();

        assert_eq!(
            store.list("a").await.unwrap(),
            vec![FlowId::from("f1"), FlowId::from("f2")]
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(
            SnapshotKey::new("ns", &FlowId::from("f")).to_string(),
            "ns/f"
        );
    }
}
