//! In-process log store
//!
//! Keeps records in memory. Used for local runs without a MongoDB instance
//! (`STORE_BACKEND=memory`) and as a controllable store in tests: connect,
//! ping and insert failures and latency can be injected, and every call is
//! counted.

use crate::{LogStore, StoreConnector};
use async_trait::async_trait;
use medquery_core::{DatabaseConfig, LogRecord, MedqueryError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Shared {
    records: Mutex<Vec<LogRecord>>,
    fail_connect: AtomicBool,
    fail_ping: AtomicBool,
    fail_insert: AtomicBool,
    latency_ms: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
    pings: AtomicU64,
    insert_attempts: AtomicU64,
}

impl Shared {
    async fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

/// Connector whose sessions all write into one shared record list.
///
/// Cloning is cheap and clones observe the same records and counters.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records persisted so far, in insertion order
    pub fn records(&self) -> Vec<LogRecord> {
        self.shared
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u64 {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Insert calls, including failed ones
    pub fn insert_attempts(&self) -> u64 {
        self.shared.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.shared.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_insert(&self, fail: bool) {
        self.shared.fail_insert.store(fail, Ordering::SeqCst);
    }

    /// Delay applied to every connect, ping and insert
    pub fn set_latency(&self, latency: Duration) {
        self.shared
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self, _config: &DatabaseConfig) -> Result<Arc<dyn LogStore>> {
        self.shared.simulate_latency().await;

        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(MedqueryError::Connection(
                "memory store refused connection".to_string(),
            ));
        }

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryLogStore {
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One session on a [`MemoryConnector`]
pub struct MemoryLogStore {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryLogStore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MedqueryError::Connection("session already closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        self.shared.simulate_latency().await;
        self.ensure_open()?;

        if self.shared.fail_ping.load(Ordering::SeqCst) {
            return Err(MedqueryError::Connection("memory store ping failed".to_string()));
        }
        Ok(())
    }

    async fn insert(&self, record: &LogRecord) -> Result<()> {
        self.shared.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.shared.simulate_latency().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(MedqueryError::Persistence("session already closed".to_string()));
        }
        if self.shared.fail_insert.load(Ordering::SeqCst) {
            return Err(MedqueryError::Persistence("memory store write failed".to_string()));
        }

        self.shared
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medquery_core::Fault;

    fn record() -> LogRecord {
        LogRecord::failure("q", 5, &Fault::new("Test", "x"))
    }

    #[tokio::test]
    async fn test_sessions_share_records() {
        let connector = MemoryConnector::new();
        let config = DatabaseConfig::default();

        let a = connector.connect(&config).await.unwrap();
        let b = connector.connect(&config).await.unwrap();
        a.insert(&record()).await.unwrap();
        b.insert(&record()).await.unwrap();

        assert_eq!(connector.records().len(), 2);
        assert_eq!(connector.connects(), 2);
        assert_eq!(a.backend(), "memory");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let connector = MemoryConnector::new();
        let config = DatabaseConfig::default();
        let store = connector.connect(&config).await.unwrap();

        connector.set_fail_ping(true);
        assert!(matches!(store.ping().await, Err(MedqueryError::Connection(_))));

        connector.set_fail_insert(true);
        assert!(matches!(
            store.insert(&record()).await,
            Err(MedqueryError::Persistence(_))
        ));
        assert_eq!(connector.insert_attempts(), 1);
        assert!(connector.records().is_empty());

        connector.set_fail_connect(true);
        assert!(connector.connect(&config).await.is_err());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_close_is_counted_once() {
        let connector = MemoryConnector::new();
        let store = connector.connect(&DatabaseConfig::default()).await.unwrap();

        store.close().await;
        store.close().await;

        assert_eq!(connector.closes(), 1);
        assert!(store.ping().await.is_err());
        assert!(store.insert(&record()).await.is_err());
    }
}
