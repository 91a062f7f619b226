//! Log sink and connection lifecycle
//!
//! [`LogSink`] owns the decision of when a store session exists:
//!
//! - `startup`: one session opened and pinged by [`LogSink::start`], shared by
//!   every request, closed by [`LogSink::stop`].
//! - `cached`: one session opened by the first [`LogSink::acquire`], shared
//!   afterwards. A failed attempt is not cached.
//! - `per-request`: a fresh session per [`LogSink::acquire`], owned by the
//!   returned [`ConnectionHandle`] and closed by [`LogSink::release`] or,
//!   failing that, when the handle is dropped.
//!
//! Every store round trip is bounded by `database.timeout_ms`.
//!
//! Author: hephaex@gmail.com

use crate::{LogStore, StoreConnector};
use medquery_core::{ConnectionPolicy, DatabaseConfig, LogRecord, MedqueryError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    releases: AtomicU64,
    inserts_ok: AtomicU64,
    inserts_failed: AtomicU64,
}

/// Snapshot of sink activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    /// Sessions opened
    pub connects: u64,
    /// Sessions closed (per-request releases and shutdown of shared sessions)
    pub releases: u64,
    pub inserts_ok: u64,
    pub inserts_failed: u64,
}

/// Access to a store session for the duration of one request.
///
/// Shared handles point at the process-wide session and releasing them does
/// nothing. Owned handles close their session when released or dropped.
pub struct ConnectionHandle {
    store: Arc<dyn LogStore>,
    owned: bool,
    released: bool,
    close_timeout: Duration,
    counters: Arc<Counters>,
}

impl ConnectionHandle {
    /// Whether this handle exclusively owns its session
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    async fn close(mut self) {
        if !self.owned || self.released {
            return;
        }
        self.released = true;
        self.counters.releases.fetch_add(1, Ordering::SeqCst);

        if timeout(self.close_timeout, self.store.close()).await.is_err() {
            tracing::warn!("Timed out closing per-request store session");
        } else {
            tracing::debug!(backend = self.store.backend(), "Per-request store session closed");
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if !self.owned || self.released {
            return;
        }
        self.released = true;
        self.counters.releases.fetch_add(1, Ordering::SeqCst);

        // Reached when a request future is cancelled or unwinds before release.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let store = self.store.clone();
                let limit = self.close_timeout;
                runtime.spawn(async move {
                    let _ = timeout(limit, store.close()).await;
                });
                tracing::debug!("Per-request store session dropped without release; close scheduled");
            }
            Err(_) => {
                tracing::warn!("Per-request store session dropped outside a runtime; not closed");
            }
        }
    }
}

/// Result of a health probe against the log store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProbeReport {
    /// A usable session exists (or could be opened)
    pub handle_present: bool,
    /// Outcome of the liveness ping; `None` when no ping was sent
    pub ping_ok: Option<bool>,
    /// Round trip of the ping in milliseconds
    pub latency_ms: Option<u64>,
    /// Why the store is unusable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.handle_present && self.ping_ok != Some(false)
    }

    /// Report for a store that cannot be used at all
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            handle_present: false,
            ping_ok: None,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

/// Persists query log records under a configured connection policy
pub struct LogSink {
    config: DatabaseConfig,
    connector: Arc<dyn StoreConnector>,
    shared: Mutex<Option<Arc<dyn LogStore>>>,
    counters: Arc<Counters>,
}

impl LogSink {
    /// Create a sink. Fails with `Configuration` when no connection string is
    /// configured for a backend that needs one.
    pub fn new(config: DatabaseConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        if !config.is_configured() {
            return Err(MedqueryError::Configuration(
                "MONGO_URI environment variable is not set".to_string(),
            ));
        }

        Ok(Self {
            config,
            connector,
            shared: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.config.policy
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            connects: self.counters.connects.load(Ordering::SeqCst),
            releases: self.counters.releases.load(Ordering::SeqCst),
            inserts_ok: self.counters.inserts_ok.load(Ordering::SeqCst),
            inserts_failed: self.counters.inserts_failed.load(Ordering::SeqCst),
        }
    }

    /// Open the process-wide session for the `startup` policy and confirm it
    /// with a ping. On failure the sink stays without a session and every
    /// `acquire` reports `Connection`. Other policies have nothing to do.
    pub async fn start(&self) -> Result<()> {
        if self.config.policy != ConnectionPolicy::Startup {
            tracing::info!(policy = %self.config.policy, "Log sink ready; sessions open on demand");
            return Ok(());
        }

        let mut shared = self.shared.lock().await;
        if shared.is_some() {
            return Ok(());
        }

        let store = self.connect().await?;
        if let Err(e) = self.ping(store.as_ref()).await {
            self.close_shared(store).await;
            return Err(e);
        }

        tracing::info!(
            backend = store.backend(),
            database = %self.config.database,
            collection = %self.config.collection,
            "Log store connected and ping successful"
        );
        *shared = Some(store);
        Ok(())
    }

    /// Close the process-wide session, if any. Safe to call repeatedly.
    pub async fn stop(&self) {
        let store = self.shared.lock().await.take();
        if let Some(store) = store {
            tracing::info!("Closing log store connection");
            self.close_shared(store).await;
        }
    }

    /// Obtain a handle according to the connection policy
    pub async fn acquire(&self) -> Result<ConnectionHandle> {
        match self.config.policy {
            ConnectionPolicy::Startup => {
                let shared = self.shared.lock().await;
                match shared.as_ref() {
                    Some(store) => Ok(self.shared_handle(store.clone())),
                    None => Err(MedqueryError::Connection(
                        "No log store connection was established at startup".to_string(),
                    )),
                }
            }
            ConnectionPolicy::Cached => {
                // Covers the wait behind another caller's connect as well.
                match timeout(self.config.timeout(), self.acquire_cached()).await {
                    Ok(result) => result,
                    Err(_) => Err(MedqueryError::Connection(format!(
                        "Log store session not available within {}ms",
                        self.config.timeout_ms
                    ))),
                }
            }
            ConnectionPolicy::PerRequest => {
                let store = self.connect().await?;
                Ok(ConnectionHandle {
                    store,
                    owned: true,
                    released: false,
                    close_timeout: self.config.timeout(),
                    counters: self.counters.clone(),
                })
            }
        }
    }

    /// Persist one record. Timeouts and store failures are `Persistence`.
    pub async fn insert(&self, handle: &ConnectionHandle, record: &LogRecord) -> Result<()> {
        let result = match timeout(self.config.timeout(), handle.store.insert(record)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(MedqueryError::Persistence(msg))) => Err(MedqueryError::Persistence(msg)),
            Ok(Err(other)) => Err(MedqueryError::Persistence(other.to_string())),
            Err(_) => Err(MedqueryError::Persistence(format!(
                "Log insert timed out after {}ms",
                self.config.timeout_ms
            ))),
        };

        match &result {
            Ok(()) => {
                self.counters.inserts_ok.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    request_id = %record.request_id,
                    status = %record.status,
                    "Log record stored"
                );
            }
            Err(_) => {
                self.counters.inserts_failed.fetch_add(1, Ordering::SeqCst);
            }
        }
        result
    }

    /// Give a handle back. Closes owned sessions; shared handles are a no-op.
    pub async fn release(&self, handle: ConnectionHandle) {
        handle.close().await;
    }

    /// Report whether a usable session exists and, when `health_ping` is on,
    /// whether it answers a ping. Never fails.
    pub async fn probe(&self) -> ProbeReport {
        let handle = match self.acquire().await {
            Ok(handle) => handle,
            Err(e) => return ProbeReport::unavailable(e.to_string()),
        };

        let mut report = ProbeReport {
            handle_present: true,
            ..ProbeReport::default()
        };

        if self.config.health_ping {
            let started = Instant::now();
            let outcome = self.ping(handle.store.as_ref()).await;
            report.latency_ms = Some(started.elapsed().as_millis() as u64);
            match outcome {
                Ok(()) => report.ping_ok = Some(true),
                Err(e) => {
                    report.ping_ok = Some(false);
                    report.error = Some(e.to_string());
                }
            }
        }

        self.release(handle).await;
        report
    }

    async fn acquire_cached(&self) -> Result<ConnectionHandle> {
        // Held across connect so concurrent first requests open one session.
        let mut shared = self.shared.lock().await;
        if let Some(store) = shared.as_ref() {
            return Ok(self.shared_handle(store.clone()));
        }

        let store = self.connect().await?;
        tracing::info!(backend = store.backend(), "Log store session cached");
        *shared = Some(store.clone());
        Ok(self.shared_handle(store))
    }

    fn shared_handle(&self, store: Arc<dyn LogStore>) -> ConnectionHandle {
        ConnectionHandle {
            store,
            owned: false,
            released: false,
            close_timeout: self.config.timeout(),
            counters: self.counters.clone(),
        }
    }

    async fn connect(&self) -> Result<Arc<dyn LogStore>> {
        let store = match timeout(self.config.timeout(), self.connector.connect(&self.config)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(MedqueryError::Connection(format!(
                    "Log store connection timed out after {}ms",
                    self.config.timeout_ms
                )))
            }
        };

        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(store)
    }

    async fn ping(&self, store: &dyn LogStore) -> Result<()> {
        match timeout(self.config.timeout(), store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(MedqueryError::Connection(format!(
                "Log store ping timed out after {}ms",
                self.config.timeout_ms
            ))),
        }
    }

    async fn close_shared(&self, store: Arc<dyn LogStore>) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
        if timeout(self.config.timeout(), store.close()).await.is_err() {
            tracing::warn!("Timed out closing log store connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryConnector;
    use medquery_core::{Fault, StoreBackend};

    fn sink_with(policy: ConnectionPolicy, connector: &MemoryConnector) -> LogSink {
        let config = DatabaseConfig {
            backend: StoreBackend::Memory,
            policy,
            timeout_ms: 100,
            ..DatabaseConfig::default()
        };
        LogSink::new(config, Arc::new(connector.clone())).unwrap()
    }

    fn record() -> LogRecord {
        LogRecord::failure("q", 5, &Fault::new("Test", "x"))
    }

    #[test]
    fn test_new_requires_uri_for_mongo() {
        let result = LogSink::new(DatabaseConfig::default(), Arc::new(MemoryConnector::new()));
        assert!(matches!(result, Err(MedqueryError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_startup_policy_shares_one_session() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::Startup, &connector);

        sink.start().await.unwrap();
        assert_eq!(connector.pings(), 1);

        for _ in 0..3 {
            let handle = sink.acquire().await.unwrap();
            assert!(!handle.is_owned());
            sink.insert(&handle, &record()).await.unwrap();
            sink.release(handle).await;
        }

        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.closes(), 0);
        assert_eq!(connector.records().len(), 3);

        sink.stop().await;
        sink.stop().await;
        assert_eq!(connector.closes(), 1);
        assert!(sink.acquire().await.is_err());
    }

    #[tokio::test]
    async fn test_startup_ping_failure_leaves_sink_degraded() {
        let connector = MemoryConnector::new();
        connector.set_fail_ping(true);
        let sink = sink_with(ConnectionPolicy::Startup, &connector);

        let err = sink.start().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(connector.closes(), 1);

        let err = sink.acquire().await.err().unwrap();
        assert!(matches!(err, MedqueryError::Connection(_)));

        let report = sink.probe().await;
        assert!(!report.is_healthy());
        assert!(!report.handle_present);
    }

    #[tokio::test]
    async fn test_cached_policy_connects_lazily_once() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::Cached, &connector);

        sink.start().await.unwrap();
        assert_eq!(connector.connects(), 0);

        for _ in 0..4 {
            let handle = sink.acquire().await.unwrap();
            sink.release(handle).await;
        }
        assert_eq!(connector.connects(), 1);

        sink.stop().await;
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_cached_policy_retries_after_failure() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::Cached, &connector);

        connector.set_fail_connect(true);
        assert!(sink.acquire().await.is_err());

        connector.set_fail_connect(false);
        assert!(sink.acquire().await.is_ok());
        assert_eq!(sink.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_cached_policy_concurrent_first_use() {
        let connector = MemoryConnector::new();
        connector.set_latency(Duration::from_millis(20));
        let sink = Arc::new(sink_with(ConnectionPolicy::Cached, &connector));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sink = sink.clone();
                tokio::spawn(async move { sink.acquire().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_cached_policy_bounds_concurrent_waits() {
        let connector = MemoryConnector::new();
        connector.set_latency(Duration::from_millis(500));
        let sink = Arc::new(sink_with(ConnectionPolicy::Cached, &connector));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let result = sink.acquire().await.map(|_| ());
                    (result, started.elapsed())
                })
            })
            .collect();

        let mut slowest = Duration::ZERO;
        for task in tasks {
            let (result, elapsed) = task.await.unwrap();
            assert!(matches!(result, Err(MedqueryError::Connection(_))));
            slowest = slowest.max(elapsed);
        }

        assert!(slowest < Duration::from_millis(200), "slowest acquire took {slowest:?}");
        assert_eq!(sink.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_unreachable_mongo_fails_acquire() {
        for policy in [ConnectionPolicy::Cached, ConnectionPolicy::PerRequest] {
            let config = DatabaseConfig {
                uri: Some("mongodb://127.0.0.1:1".to_string()),
                policy,
                timeout_ms: 300,
                ..DatabaseConfig::default()
            };
            let sink = LogSink::new(config, Arc::new(crate::MongoConnector)).unwrap();

            let err = sink.acquire().await.err().unwrap();
            assert!(matches!(err, MedqueryError::Connection(_)), "{policy}: {err}");
            assert_eq!(sink.stats().connects, 0);

            // Nothing was cached; the next call tries again and fails the same way.
            assert!(sink.acquire().await.is_err());
            assert!(!sink.probe().await.is_healthy());
        }
    }

    #[tokio::test]
    async fn test_per_request_policy_releases_every_handle() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::PerRequest, &connector);

        for _ in 0..3 {
            let handle = sink.acquire().await.unwrap();
            assert!(handle.is_owned());
            sink.insert(&handle, &record()).await.unwrap();
            sink.release(handle).await;
        }

        let stats = sink.stats();
        assert_eq!(stats.connects, 3);
        assert_eq!(stats.releases, 3);
        assert_eq!(connector.closes(), 3);
    }

    #[tokio::test]
    async fn test_dropped_owned_handle_is_closed() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::PerRequest, &connector);

        {
            let _handle = sink.acquire().await.unwrap();
        }
        assert_eq!(sink.stats().releases, 1);

        // Let the scheduled close run.
        for _ in 0..10 {
            if connector.closes() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(connector.closes(), 1);
    }

    #[tokio::test]
    async fn test_insert_failures_are_persistence_errors() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::Cached, &connector);
        let handle = sink.acquire().await.unwrap();

        connector.set_fail_insert(true);
        let err = sink.insert(&handle, &record()).await.unwrap_err();
        assert!(matches!(err, MedqueryError::Persistence(_)));

        connector.set_fail_insert(false);
        connector.set_latency(Duration::from_millis(500));
        let err = sink.insert(&handle, &record()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let stats = sink.stats();
        assert_eq!(stats.inserts_failed, 2);
        assert_eq!(stats.inserts_ok, 0);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_connection_error() {
        let connector = MemoryConnector::new();
        connector.set_latency(Duration::from_millis(500));
        let sink = sink_with(ConnectionPolicy::PerRequest, &connector);

        let err = sink.acquire().await.err().unwrap();
        assert!(matches!(err, MedqueryError::Connection(_)));
        assert_eq!(sink.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_probe_reports_ping_outcome() {
        let connector = MemoryConnector::new();
        let sink = sink_with(ConnectionPolicy::PerRequest, &connector);

        let report = sink.probe().await;
        assert!(report.is_healthy());
        assert_eq!(report.ping_ok, Some(true));
        assert!(report.latency_ms.is_some());

        connector.set_fail_ping(true);
        let report = sink.probe().await;
        assert!(!report.is_healthy());
        assert!(report.handle_present);
        assert_eq!(report.ping_ok, Some(false));
        assert!(report.error.is_some());

        assert_eq!(sink.stats().connects, sink.stats().releases);
    }

    #[tokio::test]
    async fn test_probe_without_ping() {
        let connector = MemoryConnector::new();
        let config = DatabaseConfig {
            backend: StoreBackend::Memory,
            policy: ConnectionPolicy::Cached,
            health_ping: false,
            ..DatabaseConfig::default()
        };
        let sink = LogSink::new(config, Arc::new(connector.clone())).unwrap();

        let report = sink.probe().await;
        assert!(report.is_healthy());
        assert_eq!(report.ping_ok, None);
        assert_eq!(connector.pings(), 0);
    }
}
