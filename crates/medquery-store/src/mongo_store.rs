//! MongoDB implementation of the log store
//!
//! Author: hephaex@gmail.com

use crate::{LogStore, StoreConnector};
use async_trait::async_trait;
use medquery_core::{DatabaseConfig, LogRecord, LogStatus, MedqueryError, Result};
use mongodb::bson::{doc, DateTime as BsonDateTime};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde::Serialize;
use std::sync::Arc;

const APP_NAME: &str = "medquery";

/// MongoDB log store
pub struct MongoLogStore {
    client: Client,
    collection: Collection<LogDocument>,
}

impl MongoLogStore {
    /// Create a client for the configured connection string.
    ///
    /// The driver connects lazily; the first `ping` or `insert` performs
    /// server selection bounded by `timeout_ms`.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let uri = config.uri.as_deref().ok_or_else(|| {
            MedqueryError::Configuration("MONGO_URI environment variable is not set".to_string())
        })?;

        let options = client_options(uri, config).await?;
        let client = Client::with_options(options)
            .map_err(|e| MedqueryError::Connection(format!("MongoDB client creation failed: {e}")))?;

        let collection = client
            .database(&config.database)
            .collection::<LogDocument>(&config.collection);

        tracing::info!(
            database = %config.database,
            collection = %config.collection,
            "MongoDB client created"
        );

        Ok(Self { client, collection })
    }
}

/// Parse a connection string and bound server selection and connect time
pub async fn client_options(uri: &str, config: &DatabaseConfig) -> Result<ClientOptions> {
    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(|e| MedqueryError::Configuration(format!("Invalid MongoDB connection string: {e}")))?;

    options.server_selection_timeout = Some(config.timeout());
    options.connect_timeout = Some(config.timeout());
    if options.app_name.is_none() {
        options.app_name = Some(APP_NAME.to_string());
    }

    Ok(options)
}

/// Document written to the log collection
#[derive(Debug, Clone, Serialize)]
struct LogDocument {
    request_id: String,
    timestamp: BsonDateTime,
    request_query: String,
    request_top_k: i64,
    status: LogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_contexts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_traceback: Option<String>,
}

impl From<&LogRecord> for LogDocument {
    fn from(record: &LogRecord) -> Self {
        Self {
            request_id: record.request_id.to_string(),
            timestamp: BsonDateTime::from_millis(record.timestamp.timestamp_millis()),
            request_query: record.request_query.clone(),
            request_top_k: record.request_top_k,
            status: record.status,
            response_answer: record.response_answer.clone(),
            response_contexts: record.response_contexts.clone(),
            error_message: record.error_message.clone(),
            error_type: record.error_type.clone(),
            error_traceback: record.error_traceback.clone(),
        }
    }
}

#[async_trait]
impl LogStore for MongoLogStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| MedqueryError::Connection(format!("MongoDB ping failed: {e}")))?;

        Ok(())
    }

    async fn insert(&self, record: &LogRecord) -> Result<()> {
        self.collection
            .insert_one(LogDocument::from(record))
            .await
            .map_err(|e| MedqueryError::Persistence(format!("Failed to insert log record: {e}")))?;

        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        tracing::debug!("MongoDB client shut down");
    }
}

/// Connector producing [`MongoLogStore`] sessions
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoConnector;

#[async_trait]
impl StoreConnector for MongoConnector {
    /// Create a client and confirm the server answers.
    ///
    /// The driver defers server selection to the first operation, so without
    /// the ping an unreachable store would only surface on insert.
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn LogStore>> {
        let store = MongoLogStore::connect(config).await?;

        if let Err(e) = store.ping().await {
            store.close().await;
            return Err(e);
        }

        Ok(Arc::new(store))
    }
}
