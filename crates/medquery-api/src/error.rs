//! API error handling
//!
//! Failures carry as much diagnostic detail as is safe for an internal
//! service: 500 responses always include the fault type and message, and the
//! trace only when `query.expose_error_trace` is enabled.
//!
//! Author: hephaex@gmail.com

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use medquery_core::{FieldError, Fault, MedqueryError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    #[schema(example = "SERVICE_UNAVAILABLE")]
    pub error: String,
    /// Human-readable message
    pub message: String,
    /// Fault type for internal errors
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Fault trace, when exposure is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Per-field validation failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            kind: None,
            details: None,
            traceback: None,
            fields: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn service_unavailable() -> Self {
        Self::new(
            "SERVICE_UNAVAILABLE",
            "Service unavailable: Cannot connect to log database.",
        )
    }

    pub fn validation(fields: Vec<FieldError>) -> Self {
        let mut error = Self::new("VALIDATION_ERROR", "Request validation failed");
        error.fields = Some(fields);
        error
    }

    pub fn internal(fault: &Fault, expose_trace: bool) -> Self {
        let mut error = Self::new(
            "INTERNAL_ERROR",
            format!("An internal server error occurred. Error: {}", fault.message),
        );
        error.kind = Some(fault.kind.clone());
        if expose_trace {
            error.traceback = fault.trace.clone();
        }
        error
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    /// Log store not configured or unreachable
    ServiceUnavailable(String),
    /// Malformed or out-of-range request
    Validation(Vec<FieldError>),
    /// Unexpected fault while answering
    Internal { fault: Fault, expose_trace: bool },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::ServiceUnavailable(details) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiError::service_unavailable().with_details(details),
            ),
            AppError::Validation(fields) => {
                (StatusCode::UNPROCESSABLE_ENTITY, ApiError::validation(fields))
            }
            AppError::Internal {
                fault,
                expose_trace,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::internal(&fault, expose_trace),
            ),
        };

        (status, Json(error)).into_response()
    }
}

impl From<MedqueryError> for AppError {
    fn from(err: MedqueryError) -> Self {
        match err {
            MedqueryError::Configuration(_) | MedqueryError::Connection(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            MedqueryError::Validation(fields) => AppError::Validation(fields),
            other => AppError::Internal {
                fault: Fault::from_error(&other),
                expose_trace: false,
            },
        }
    }
}

/// Turn a JSON extraction failure into field errors.
///
/// serde names the offending field only for missing fields; other failures
/// are attributed to the whole body.
pub fn rejection_field_errors(rejection: &JsonRejection) -> Vec<FieldError> {
    let text = rejection.body_text();

    if let Some(field) = missing_field_name(&text) {
        return vec![FieldError::new(field, format!("field `{field}` is required"))];
    }

    let message = match rejection {
        JsonRejection::MissingJsonContentType(_) => {
            "Expected request with `Content-Type: application/json`".to_string()
        }
        _ => text,
    };
    vec![FieldError::new("body", message)]
}

fn missing_field_name(text: &str) -> Option<&str> {
    let rest = text.split("missing field `").nth(1)?;
    rest.split('`').next().filter(|name| !name.is_empty())
}
