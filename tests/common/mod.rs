//! Shared fixtures for pipeline tests.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use file_relay::broker::{Broker, SqliteBroker};
use file_relay::config::RetryConfig;
use file_relay::error::{BrokerError, StorageError};
use file_relay::relay::RelayStats;
use file_relay::storage::{RemoteSession, RemoteStorage};
use file_relay::{HashStore, Publisher, Readiness, Relay, UploadWorker};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const QUEUE: &str = "sftp_queue";
pub const REMOTE_ROOT: &str = "/upload";

/// Remote storage that fails a scripted number of uploads, then records writes
#[derive(Clone)]
pub struct ScriptedStorage {
    inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
    open_sessions: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedStorage {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                failures_left: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                writes: Mutex::new(Vec::new()),
                open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(0)
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.writes.lock().clone()
    }

    pub fn writes_of(&self, content: &[u8]) -> usize {
        self.inner
            .writes
            .lock()
            .iter()
            .filter(|(_, c)| c == content)
            .count()
    }
}

struct ScriptedSession {
    inner: Arc<ScriptedInner>,
}

#[async_trait]
impl RemoteStorage for ScriptedStorage {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, StorageError> {
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            inner: self.inner.clone(),
        }))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn upload(&mut self, data: &[u8], remote_path: &str) -> Result<(), StorageError> {
        let inner = &self.inner;
        inner.attempts.fetch_add(1, Ordering::SeqCst);
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2)).await;

        let result = if inner
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(StorageError::Upload {
                path: remote_path.to_string(),
                reason: "remote I/O error".to_string(),
            })
        } else {
            inner
                .writes
                .lock()
                .push((remote_path.to_string(), data.to_vec()));
            Ok(())
        };

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Broker whose publishes always fail
#[allow(dead_code)]
pub struct UnreachableBroker;

#[async_trait]
impl Broker for UnreachableBroker {
    async fn declare_queue(&self, _queue: &str) -> Result<(), BrokerError> {
        Err(BrokerError::Closed)
    }

    async fn publish(&self, _queue: &str, _body: Vec<u8>) -> Result<(), BrokerError> {
        Err(BrokerError::Closed)
    }

    async fn consume(
        &self,
        _queue: &str,
    ) -> Result<Box<dyn file_relay::broker::Consumer>, BrokerError> {
        Err(BrokerError::Closed)
    }

    async fn depth(&self, _queue: &str) -> Result<u64, BrokerError> {
        Err(BrokerError::Closed)
    }

    async fn close(&self) {}
}

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff_ms: 5,
        max_backoff_ms: 40,
        attempt_timeout_secs: 5,
        shutdown_grace_secs: 1,
    }
}

/// Broker, producer and storage wired up, relay not yet consuming
#[allow(dead_code)]
pub struct PreparedPipeline {
    pub hash_store: HashStore,
    pub broker: SqliteBroker,
    pub publisher: Publisher,
    pub storage: ScriptedStorage,
    pub readiness: Readiness,
    retry: RetryConfig,
}

#[allow(dead_code)]
impl PreparedPipeline {
    pub async fn new(storage: ScriptedStorage, retry: RetryConfig) -> Self {
        let broker = SqliteBroker::in_memory().await.expect("in-memory broker");
        broker.declare_queue(QUEUE).await.expect("declare queue");

        let hash_store = HashStore::new();
        let publisher = Publisher::new(hash_store.clone(), Arc::new(broker.clone()), QUEUE);

        Self {
            hash_store,
            broker,
            publisher,
            storage,
            readiness: Readiness::new(),
            retry,
        }
    }

    /// Start the worker and the relay
    pub fn begin(self) -> Pipeline {
        let shutdown = CancellationToken::new();

        let (worker, outcomes, worker_task) = UploadWorker::spawn(
            Arc::new(self.storage.clone()),
            REMOTE_ROOT,
            self.retry,
            self.readiness.clone(),
            shutdown.clone(),
        );
        let relay = Relay::new(
            self.hash_store.clone(),
            Arc::new(self.broker.clone()),
            QUEUE,
            worker,
            self.readiness.clone(),
        );
        let stats = relay.stats();
        let relay_task = tokio::spawn(relay.run(outcomes, shutdown.clone()));

        Pipeline {
            hash_store: self.hash_store,
            broker: self.broker,
            publisher: self.publisher,
            storage: self.storage,
            readiness: self.readiness,
            stats,
            shutdown,
            relay_task,
            worker_task,
        }
    }
}

/// A running producer + relay + worker wired to one in-memory broker
#[allow(dead_code)]
pub struct Pipeline {
    pub hash_store: HashStore,
    pub broker: SqliteBroker,
    pub publisher: Publisher,
    pub storage: ScriptedStorage,
    pub readiness: Readiness,
    pub stats: Arc<RelayStats>,
    pub shutdown: CancellationToken,
    relay_task: JoinHandle<Result<(), BrokerError>>,
    worker_task: JoinHandle<()>,
}

#[allow(dead_code)]
impl Pipeline {
    pub async fn start(storage: ScriptedStorage, retry: RetryConfig) -> Self {
        PreparedPipeline::new(storage, retry).await.begin()
    }

    /// Wait until `settled` deliveries have reached a terminal state
    pub async fn wait_settled(&self, settled: u64) {
        let stats = self.stats.clone();
        wait_for(move || {
            let s = stats.snapshot();
            s.delivered + s.abandoned >= settled
        })
        .await;
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.relay_task
            .await
            .expect("relay task")
            .expect("relay result");
        self.worker_task.await.expect("worker task");
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
#[allow(dead_code)]
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
