use async_trait::async_trait;
use goalflow_core::{CoreError, FlowId, SnapshotKey, SnapshotStore};
use goalflow_state_inmemory::{InMemorySnapshotStore, WriteBehindConfig, WriteBehindStore};
use mockall::mock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Store {}

    #[async_trait]
    impl SnapshotStore for Store {
        async fn save(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), CoreError>;
        async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError>;
        async fn delete(&self, key: &SnapshotKey) -> Result<(), CoreError>;
        async fn list(&self, namespace: &str) -> Result<Vec<FlowId>, CoreError>;
    }
}

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("goalflow_state_inmemory=debug,goalflow_core=debug")
        .with_test_writer()
        .try_init();
}

fn key(id: &str) -> SnapshotKey {
    SnapshotKey::new("flows", &FlowId::from(id))
}

/// Store whose writes take a while
struct SlowStore {
    inner: InMemorySnapshotStore,
    delay: Duration,
    writes: AtomicUsize,
}

#[async_trait]
impl SnapshotStore for SlowStore {
    async fn save(&self, key: &SnapshotKey, data: Vec<u8>) -> Result<(), CoreError> {
        tokio::time::sleep(self.delay).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.save(key, data).await
    }

    async fn load(&self, key: &SnapshotKey) -> Result<Option<Vec<u8>>, CoreError> {
        self.inner.load(key).await
    }

    async fn delete(&self, key: &SnapshotKey) -> Result<(), CoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<FlowId>, CoreError> {
        self.inner.list(namespace).await
    }
}

#[tokio::test]
async fn test_failed_saves_are_logged_not_returned() {
    init_test_tracing();
    let mut inner = MockStore::new();
    inner
        .expect_save()
        .times(1)
        .returning(|_, _| Err(CoreError::Store("disk full".to_string())));
    inner.expect_load().returning(|_| Ok(None));

    let store = WriteBehindStore::new(Arc::new(inner), WriteBehindConfig::default()).unwrap();
    store.save(&key("f1"), b"snapshot".to_vec()).await.unwrap();
    store.flush().await;

    assert_eq!(store.outstanding(), 0);
    assert_eq!(store.load(&key("f1")).await.unwrap(), None);
}

#[tokio::test]
async fn test_slow_saves_time_out() {
    init_test_tracing();
    let slow = Arc::new(SlowStore {
        inner: InMemorySnapshotStore::new(),
        delay: Duration::from_millis(500),
        writes: AtomicUsize::new(0),
    });
    let store = WriteBehindStore::new(
        slow.clone(),
        WriteBehindConfig {
            workers: 1,
            queue_size: 4,
            save_timeout_ms: 20,
        },
    )
    .unwrap();

    store.save(&key("f1"), b"a".to_vec()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), store.flush())
        .await
        .expect("flush should finish once the save times out");

    assert_eq!(slow.writes.load(Ordering::SeqCst), 0);
    assert_eq!(slow.inner.load(&key("f1")).await.unwrap(), None);
}

#[tokio::test]
async fn test_queued_saves_coalesce_and_stay_readable() {
    init_test_tracing();
    let slow = Arc::new(SlowStore {
        inner: InMemorySnapshotStore::new(),
        delay: Duration::from_millis(50),
        writes: AtomicUsize::new(0),
    });
    let store = WriteBehindStore::new(
        slow.clone(),
        WriteBehindConfig {
            workers: 1,
            queue_size: 8,
            save_timeout_ms: 1000,
        },
    )
    .unwrap();

    // Occupy the only worker
    store.save(&key("busy"), b"x".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    for version in 1..=5u8 {
        store.save(&key("f1"), vec![version]).await.unwrap();
    }
    assert_eq!(store.load(&key("f1")).await.unwrap(), Some(vec![5]));

    store.flush().await;
    assert_eq!(slow.inner.load(&key("f1")).await.unwrap(), Some(vec![5]));
    assert_eq!(slow.writes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_engine_snapshots_through_write_behind() {
    init_test_tracing();
    use goalflow_core::{
        Args, AttributeRole, AttributeSpec, AttributeType, Engine, EngineConfig, FlowContext,
        Step, StepId, StepType,
    };

    let inner = InMemorySnapshotStore::new();
    let store = Arc::new(
        WriteBehindStore::new(Arc::new(inner.clone()), WriteBehindConfig::default()).unwrap(),
    );
    let engine = Engine::builder(EngineConfig::default())
        .store(store.clone())
        .build();
    engine
        .catalog()
        .register(
            Step::new("greet", StepType::Script)
                .with_script("jexl", "{greeting: 'hello ' + name}")
                .with_attribute("name", AttributeSpec::new(AttributeRole::Required, AttributeType::String))
                .with_attribute("greeting", AttributeSpec::new(AttributeRole::Output, AttributeType::String)),
        )
        .unwrap();

    let id = FlowId::from("persisted");
    let mut init = Args::new();
    init.insert("name".to_string(), serde_json::json!("ada"));
    engine
        .start_flow(id.clone(), &[StepId::from("greet")], init)
        .await
        .unwrap();
    engine.wait_for_flow(&id, Duration::from_secs(5)).await.unwrap();
    store.flush().await;

    let bytes = inner
        .load(&SnapshotKey::new("goalflow", &id))
        .await
        .unwrap()
        .expect("snapshot should be written");
    let flow: FlowContext = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(flow.state["greeting"], serde_json::json!("hello ada"));
    assert!(flow.is_terminal());
}
