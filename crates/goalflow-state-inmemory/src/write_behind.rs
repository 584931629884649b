//! Write-behind snapshot saving
//!
//! [`WriteBehindStore`] accepts saves into a bounded queue and lets a fixed
//! pool of workers write them to the wrapped store. Saves for a key that is
//! already queued replace the queued bytes, so a burst of transitions on one
//! flow costs a single write. Reads consult the queued bytes first.
//!
//! Two workers can still write the same key concurrently when a save
//! arrives while an earlier one is being written; the store does not order
//! those writes.

use crate::error::StoreError;
use async_trait::async_trait;
use goalflow_core::{CoreError, FlowId, SnapshotKey, SnapshotStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    /// Number of concurrent writer tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Keys that may wait for a worker before `save` applies back-pressure
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Upper bound for one write to the wrapped store
    #[serde(default = "default_save_timeout_ms")]
    pub save_timeout_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_queue_size() -> usize {
    1024
}

fn default_save_timeout_ms() -> u64 {
    5000
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_size: default_queue_size(),
            save_timeout_ms: default_save_timeout_ms(),
        }
    }
}

impl WriteBehindConfig {
    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.workers == 0 {
            return Err(StoreError::Configuration(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.queue_size == 0 {
            return Err(StoreError::Configuration(
                "queue_size must be greater than zero".to_string(),
            ));
        }
        if self.save_timeout_ms == 0 {
            return Err(StoreError::Configuration(
                "save_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct Shared {
    inner: Arc<dyn SnapshotStore>,
    /// Latest bytes per queued key
    pending: Mutex<HashMap<SnapshotKey, Vec<u8>>>,
    /// Queued plus in-progress keys
    outstanding: AtomicUsize,
    idle: Notify,
    save_timeout: Duration,
}

impl Shared {
    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn write(&self, key: SnapshotKey) -> Result<(), StoreError> {
        let Some(bytes) = self.pending.lock().await.remove(&key) else {
            // Deleted while queued
            return Ok(());
        };
        match tokio::time::timeout(self.save_timeout, self.inner.save(&key, bytes)).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.save_timeout)),
        }
    }
}

/// Snapshot store that saves through a bounded queue and a worker pool
pub struct WriteBehindStore {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<SnapshotKey>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WriteBehindStore {
    /// Wrap `inner` and start the workers; must be called inside a runtime
    pub fn new(inner: Arc<dyn SnapshotStore>, config: WriteBehindConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            inner,
            pending: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            save_timeout: config.save_timeout(),
        });

        let (tx, rx) = mpsc::channel::<SnapshotKey>(config.queue_size);
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..config.workers)
            .map(|worker| tokio::spawn(run_worker(worker, shared.clone(), rx.clone())))
            .collect();

        info!(
            workers = config.workers,
            queue_size = config.queue_size,
            save_timeout_ms = config.save_timeout_ms,
            "Write-behind snapshot store started"
        );

        Ok(Self {
            shared,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Keys queued or being written
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every accepted save has been written or given up on
    pub async fn flush(&self) {
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting saves, drain the queue and stop the workers
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.sender.lock().await.take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            worker
                .await
                .map_err(|e| StoreError::Worker(e.to_string()))?;
        }
        info!("Write-behind snapshot store stopped");
        Ok(())
    }

    async fn enqueue(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), StoreError> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or(StoreError::Closed)?;

        let newly_queued = self
            .shared
            .pending
            .lock()
            .await
            .insert(key.clone(), data)
            .is_none();
        if !newly_queued {
            debug!(key = %key, "Coalesced queued snapshot");
            return Ok(());
        }

        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        if sender.send(key.clone()).await.is_err() {
            self.shared.pending.lock().await.remove(key);
            self.shared.finish_one();
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    queue: Arc<Mutex<mpsc::Receiver<SnapshotKey>>>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(key) = next else {
            break;
        };
        match shared.write(key.clone()).await {
            Ok(()) => debug!(worker, key = %key, "Snapshot written"),
            Err(StoreError::Timeout(after)) => {
                warn!(worker, key = %key, ?after, "Snapshot save timed out")
            }
            Err(e) => error!(worker, key = %key, error = %e, "Snapshot save failed"),
        }
        shared.finish_one();
    }
    debug!(worker, "Snapshot worker stopped");
}

#[async_trait]
impl SnapshotStore for WriteBehindStore {
    async fn save(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), CoreError> {
        self.enqueue(key, data).await.map_err(CoreError::from)
    }

    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError> {
        if let Some(bytes) = self.shared.pending.lock().await.get(key) {
            return Ok(Some(bytes.clone()));
        }
        self.shared.inner.load(key).await
    }

    async fn delete(&self, key: &SnapshotKey) -> Result<(), CoreError> {
        // The queued key stays in the channel; its worker finds nothing to write
        self.shared.pending.lock().await.remove(key);
        self.shared.inner.delete(key).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<FlowId>, CoreError> {
        let mut ids: BTreeSet<FlowId> = self.shared.inner.list(namespace).await?.into_iter().collect();
        ids.extend(
            self.shared
                .pending
                .lock()
                .await
                .keys()
                .filter(|key| key.namespace == namespace)
                .map(|key| key.id.clone()),
        );
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySnapshotStore;

    fn key(id: &str) -> SnapshotKey {
        SnapshotKey::new("ns", &FlowId::from(id))
    }

    #[test]
    fn test_config_validation() {
        assert!(WriteBehindConfig::default().validate().is_ok());
        let zero_workers = WriteBehindConfig {
            workers: 0,
            ..WriteBehindConfig::default()
        };
        assert!(matches!(
            zero_workers.validate(),
            Err(StoreError::Configuration(_))
        ));
        let zero_queue = WriteBehindConfig {
            queue_size: 0,
            ..WriteBehindConfig::default()
        };
        assert!(zero_queue.validate().is_err());
    }

    #[tokio::test]
    async fn test_flush_writes_through() -> Result<(), CoreError> {
        let inner = InMemorySnapshotStore::new();
        let store = WriteBehindStore::new(Arc::new(inner.clone()), WriteBehindConfig::default())?;

        store.save(&key("f1"), b"a".to_vec()).await?;
        store.save(&key("f2"), b"b".to_vec()).await?;
        store.flush().await;

        assert_eq!(store.outstanding(), 0);
        assert_eq!(inner.load(&key("f1")).await?, Some(b"a".to_vec()));
        assert_eq!(inner.load(&key("f2")).await?, Some(b"b".to_vec()));
        assert_eq!(
            store.list("ns").await?,
            vec![FlowId::from("f1"), FlowId::from("f2")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() -> Result<(), CoreError> {
        let inner = InMemorySnapshotStore::new();
        let store = WriteBehindStore::new(
            Arc::new(inner.clone()),
            WriteBehindConfig {
                workers: 1,
                ..WriteBehindConfig::default()
            },
        )?;

        store.save(&key("f1"), b"a".to_vec()).await?;
        store.shutdown().await?;
        assert_eq!(inner.load(&key("f1")).await?, Some(b"a".to_vec()));

        let err = store.save(&key("f2"), vec![]).await.unwrap_err();
        assert!(matches!(err, CoreError::Store(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_drops_queued_snapshot() -> Result<(), CoreError> {
        let inner = InMemorySnapshotStore::new();
        let store = WriteBehindStore::new(Arc::new(inner.clone()), WriteBehindConfig::default())?;

        store.save(&key("f1"), b"a".to_vec()).await?;
        store.delete(&key("f1")).await?;
        store.flush().await;

        assert_eq!(store.load(&key("f1")).await?, None);
        Ok(())
    }
}
