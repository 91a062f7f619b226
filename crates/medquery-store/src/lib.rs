//! MedQuery Store - Request log persistence
//!
//! Provides abstraction over the document store that receives one
//! [`LogRecord`] per query, and the [`LogSink`] that decides when store
//! connections are created, shared, and closed.

use async_trait::async_trait;
use medquery_core::{DatabaseConfig, LogRecord, Result, StoreBackend};
use std::sync::Arc;

pub mod memory;
pub mod mongo_store;
pub mod sink;

pub use memory::{MemoryConnector, MemoryLogStore};
pub use mongo_store::{MongoConnector, MongoLogStore};
pub use sink::{ConnectionHandle, LogSink, ProbeReport, SinkStats};

/// An open session to the log store
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Backend name for diagnostics
    fn backend(&self) -> &'static str;

    /// Lightweight liveness round trip
    async fn ping(&self) -> Result<()>;

    /// Persist one record as a single document write
    async fn insert(&self, record: &LogRecord) -> Result<()>;

    /// Release the session's resources
    async fn close(&self);
}

/// Opens log store sessions
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Create a session. Fails with `Configuration` when the connection
    /// string is unusable, `Connection` when the store cannot be reached.
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn LogStore>>;
}

/// Connector matching the configured backend
pub fn connector_for(config: &DatabaseConfig) -> Arc<dyn StoreConnector> {
    match config.backend {
        StoreBackend::Mongo => Arc::new(MongoConnector),
        StoreBackend::Memory => Arc::new(MemoryConnector::new()),
    }
}
