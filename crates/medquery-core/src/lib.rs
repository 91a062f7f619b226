//! MedQuery Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout MedQuery:
//! - Query request/response models and their validation
//! - Log records persisted for every query
//! - Common error types
//! - The answer generation seam
//! - Configuration management

pub mod config;
pub mod generator;

pub use config::{
    AppConfig, ConfigError, ConnectionPolicy, DatabaseConfig, LoggingConfig, QueryConfig,
    ServerConfig, StoreBackend,
};
pub use generator::{AnswerGenerator, PlaceholderGenerator};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for MedQuery operations
#[derive(Error, Debug)]
pub enum MedqueryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Validation error: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Generation error: {0}")]
    Generation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MedqueryError {
    /// Stable error kind, recorded as `error_type` in log records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::Connection(_) => "ConnectionError",
            Self::Persistence(_) => "PersistenceError",
            Self::Validation(_) => "ValidationError",
            Self::Generation(_) => "GenerationError",
            Self::Other(_) => "UnexpectedFault",
        }
    }

    /// Whether the error means the log store cannot be used at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, MedqueryError>;

/// A single invalid request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FieldError {
    /// Field name (`query`, `top_k`, or `body` when the payload is unreadable)
    #[schema(example = "top_k")]
    pub field: String,
    /// What is wrong with it
    #[schema(example = "top_k must be between 1 and 50")]
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

// ============================================================================
// Query Models
// ============================================================================

/// Default number of contexts requested
pub const DEFAULT_TOP_K: i64 = 5;

fn default_top_k() -> i64 {
    DEFAULT_TOP_K
}

/// Medical query submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueryRequest {
    /// The user's question
    #[schema(example = "What are the symptoms of diabetes?")]
    pub query: String,

    /// Number of contexts to retrieve
    #[serde(default = "default_top_k")]
    #[schema(example = 5, default = 5)]
    pub top_k: i64,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>, top_k: i64) -> Self {
        Self {
            query: query.into(),
            top_k,
        }
    }

    /// Check field constraints, collecting every violation
    pub fn validate(&self, max_top_k: i64) -> Result<()> {
        let mut errors = Vec::new();

        if self.query.trim().is_empty() {
            errors.push(FieldError::new("query", "query cannot be empty"));
        }
        if self.top_k < 1 || self.top_k > max_top_k {
            errors.push(FieldError::new(
                "top_k",
                format!("top_k must be between 1 and {max_top_k}"),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MedqueryError::Validation(errors))
        }
    }
}

/// Generated answer with its supporting contexts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueryResponse {
    /// Generated answer
    #[schema(example = "This is a placeholder answer for 'What are the symptoms of diabetes?'.")]
    pub answer: String,

    /// Contexts the answer was derived from, in rank order
    pub contexts: Vec<String>,
}

// ============================================================================
// Faults
// ============================================================================

/// Description of an unexpected failure while answering a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    /// Fault type, e.g. `GenerationError` or `Panic`
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Error source chain or panic location
    pub trace: Option<String>,
}

impl Fault {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// Build a fault from a core error, walking its source chain
    pub fn from_error(err: &MedqueryError) -> Self {
        let mut chain = Vec::new();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }

        let trace = if chain.is_empty() {
            format!("{}: {err}", err.kind())
        } else {
            format!("{}: {err}\ncaused by: {}", err.kind(), chain.join("\ncaused by: "))
        };

        Self::new(err.kind(), err.to_string()).with_trace(trace)
    }

    /// Build a fault from a caught panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };

        Self::new("Panic", message.clone()).with_trace(format!("panicked: {message}"))
    }
}

// ============================================================================
// Log Records
// ============================================================================

/// Outcome recorded for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One document persisted per query request.
///
/// Built through [`LogRecord::success`] or [`LogRecord::failure`] so that
/// exactly one of the response or error field groups is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub request_query: String,
    pub request_top_k: i64,
    pub status: LogStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_contexts: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_traceback: Option<String>,
}

impl LogRecord {
    /// Record for an answered query
    pub fn success(request: &QueryRequest, response: &QueryResponse) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_query: request.query.clone(),
            request_top_k: request.top_k,
            status: LogStatus::Success,
            response_answer: Some(response.answer.clone()),
            response_contexts: Some(response.contexts.clone()),
            error_message: None,
            error_type: None,
            error_traceback: None,
        }
    }

    /// Record for a query that could not be answered
    pub fn failure(request_query: impl Into<String>, request_top_k: i64, fault: &Fault) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            request_query: request_query.into(),
            request_top_k,
            status: LogStatus::Error,
            response_answer: None,
            response_contexts: None,
            error_message: Some(fault.message.clone()),
            error_type: Some(fault.kind.clone()),
            error_traceback: fault.trace.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == LogStatus::Success
    }
}
