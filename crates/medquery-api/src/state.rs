//! Application state management
//!
//! Author: hephaex@gmail.com

use medquery_core::{AnswerGenerator, AppConfig, MedqueryError, PlaceholderGenerator};
use medquery_store::{LogSink, ProbeReport, StoreConnector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Server start time
    pub start_time: Instant,
    /// Request counter
    pub request_count: AtomicU64,
    /// Log sink (absent when the store is not configured)
    sink: Option<Arc<LogSink>>,
    /// Why the sink is absent
    setup_error: Option<String>,
    /// Answer generator
    generator: Arc<dyn AnswerGenerator>,
}

impl AppState {
    /// Create state without a log sink.
    ///
    /// Every query is answered with 503 until a sink is attached through
    /// [`AppState::start`].
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            sink: None,
            setup_error: Some("MongoDB client not initialized. Check startup logs.".to_string()),
            generator: Arc::new(PlaceholderGenerator),
        }
    }

    /// Build the log sink and run its startup step.
    ///
    /// Never fails: a missing connection string leaves the service without a
    /// sink, and a failed startup connection leaves a sink with no session.
    /// Both are reported by the health endpoint.
    pub async fn start(config: AppConfig, connector: Arc<dyn StoreConnector>) -> Self {
        let mut state = Self::new(config);

        let sink = match LogSink::new(state.config.database.clone(), connector) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                tracing::error!(error = %e, "Log store not configured; running degraded");
                state.setup_error = Some(match e {
                    MedqueryError::Configuration(msg) => msg,
                    other => other.to_string(),
                });
                return state;
            }
        };

        tracing::info!(
            backend = %state.config.database.backend,
            policy = %sink.policy(),
            uri = state.config.database.uri_preview().as_deref().unwrap_or("-"),
            "Initializing log sink"
        );

        if let Err(e) = sink.start().await {
            tracing::error!(error = %e, "Could not connect to log store on startup");
        }

        state.sink = Some(sink);
        state.setup_error = None;
        state
    }

    /// Close any process-wide store session
    pub async fn stop(&self) {
        if let Some(sink) = &self.sink {
            sink.stop().await;
        }
    }

    /// Replace the answer generator
    pub fn with_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn sink(&self) -> Option<&Arc<LogSink>> {
        self.sink.as_ref()
    }

    pub fn generator(&self) -> &dyn AnswerGenerator {
        self.generator.as_ref()
    }

    /// Error explaining a missing sink
    pub fn unavailable_error(&self) -> MedqueryError {
        MedqueryError::Configuration(
            self.setup_error
                .clone()
                .unwrap_or_else(|| "Log store is not configured".to_string()),
        )
    }

    /// Probe the log store; reports unavailable when there is no sink
    pub async fn probe(&self) -> ProbeReport {
        match &self.sink {
            Some(sink) => sink.probe().await,
            None => ProbeReport::unavailable(self.unavailable_error().to_string()),
        }
    }

    /// Increment request counter
    pub fn increment_requests(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Get total request count
    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}
