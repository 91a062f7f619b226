//! Query handler
//!
//! Order of operations for `POST /query`:
//! 1. obtain a log store handle, or answer 503 without generating or logging;
//! 2. parse and validate the body (422 on failure);
//! 3. generate the answer, catching panics from the generator;
//! 4. persist exactly one log record, best-effort;
//! 5. release the handle, then respond.
//!
//! Author: hephaex@gmail.com

use crate::error::{rejection_field_errors, AppError};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use medquery_core::{
    AnswerGenerator, FieldError, Fault, LogRecord, MedqueryError, QueryRequest, QueryResponse,
    DEFAULT_TOP_K,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// What became of a query once a handle was obtained
enum Outcome {
    Answered(QueryRequest, QueryResponse),
    Invalid {
        query: String,
        top_k: i64,
        fields: Vec<FieldError>,
    },
    Failed(QueryRequest, Fault),
}

impl Outcome {
    fn log_record(&self) -> LogRecord {
        match self {
            Outcome::Answered(request, response) => LogRecord::success(request, response),
            Outcome::Invalid {
                query,
                top_k,
                fields,
            } => {
                let err = MedqueryError::Validation(fields.clone());
                LogRecord::failure(query.clone(), *top_k, &Fault::new(err.kind(), err.to_string()))
            }
            Outcome::Failed(request, fault) => {
                LogRecord::failure(request.query.clone(), request.top_k, fault)
            }
        }
    }
}

/// Handle medical query requests
#[utoipa::path(
    post,
    path = "/query",
    tag = "query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Query answered", body = QueryResponse),
        (status = 422, description = "Invalid request", body = crate::error::ApiError),
        (status = 500, description = "Unexpected fault", body = crate::error::ApiError),
        (status = 503, description = "Log store unavailable", body = crate::error::ApiError)
    )
)]
pub async fn query_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    state.increment_requests();

    let Some(sink) = state.sink() else {
        tracing::warn!("Log store not configured; rejecting query");
        return Err(AppError::from(state.unavailable_error()));
    };

    let handle = sink.acquire().await.map_err(|e| {
        tracing::warn!(error = %e, "Log store unavailable; rejecting query");
        AppError::from(e)
    })?;

    let outcome = answer(&state, payload);

    let record = outcome.log_record();
    if let Err(e) = sink.insert(&handle, &record).await {
        tracing::warn!(
            request_id = %record.request_id,
            status = %record.status,
            error = %e,
            "Failed to store query log"
        );
    }
    sink.release(handle).await;

    match outcome {
        Outcome::Answered(_, response) => Ok((StatusCode::OK, Json(response))),
        Outcome::Invalid { fields, .. } => Err(AppError::Validation(fields)),
        Outcome::Failed(_, fault) => Err(AppError::Internal {
            fault,
            expose_trace: state.config.query.expose_error_trace,
        }),
    }
}

fn answer(state: &AppState, payload: Result<Json<QueryRequest>, JsonRejection>) -> Outcome {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::info!(error = %rejection.body_text(), "Rejected unreadable query body");
            return Outcome::Invalid {
                query: String::new(),
                top_k: DEFAULT_TOP_K,
                fields: rejection_field_errors(&rejection),
            };
        }
    };

    tracing::info!(
        query_len = request.query.len(),
        top_k = request.top_k,
        "Received query"
    );

    if let Err(e) = request.validate(state.config.query.max_top_k) {
        let fields = match e {
            MedqueryError::Validation(fields) => fields,
            other => vec![FieldError::new("body", other.to_string())],
        };
        return Outcome::Invalid {
            query: request.query,
            top_k: request.top_k,
            fields,
        };
    }

    match generate(state.generator(), &request) {
        Ok(response) => Outcome::Answered(request, response),
        Err(fault) => {
            tracing::error!(kind = %fault.kind, error = %fault.message, "Query generation failed");
            Outcome::Failed(request, fault)
        }
    }
}

/// Run the generator, turning errors, panics and half-built responses into faults
fn generate(generator: &dyn AnswerGenerator, request: &QueryRequest) -> Result<QueryResponse, Fault> {
    let response = match catch_unwind(AssertUnwindSafe(|| generator.generate(request))) {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => return Err(Fault::from_error(&e)),
        Err(payload) => return Err(Fault::from_panic(payload)),
    };

    if response.answer.is_empty() || response.contexts.is_empty() {
        let err = MedqueryError::Generation(format!(
            "generator '{}' returned an answer without contexts",
            generator.name()
        ));
        return Err(Fault::from_error(&err));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medquery_core::PlaceholderGenerator;

    struct EmptyGenerator;

    impl AnswerGenerator for EmptyGenerator {
        fn name(&self) -> &'static str {
            "empty"
        }

        fn generate(&self, _request: &QueryRequest) -> medquery_core::Result<QueryResponse> {
            Ok(QueryResponse {
                answer: "answer".into(),
                contexts: vec![],
            })
        }
    }

    struct PanickingGenerator;

    impl AnswerGenerator for PanickingGenerator {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn generate(&self, _request: &QueryRequest) -> medquery_core::Result<QueryResponse> {
            panic!("model weights missing")
        }
    }

    #[test]
    fn test_generate_placeholder() {
        let response = generate(&PlaceholderGenerator, &QueryRequest::new("flu", 2)).unwrap();
        assert!(response.answer.contains("flu"));
    }

    #[test]
    fn test_generate_rejects_partial_response() {
        let fault = generate(&EmptyGenerator, &QueryRequest::new("flu", 2)).unwrap_err();
        assert_eq!(fault.kind, "GenerationError");
    }

    #[test]
    fn test_generate_catches_panic() {
        let fault = generate(&PanickingGenerator, &QueryRequest::new("flu", 2)).unwrap_err();
        assert_eq!(fault.kind, "Panic");
        assert_eq!(fault.message, "model weights missing");
    }

    #[test]
    fn test_invalid_outcome_record() {
        let outcome = Outcome::Invalid {
            query: "".into(),
            top_k: 0,
            fields: vec![FieldError::new("top_k", "top_k must be between 1 and 50")],
        };
        let record = outcome.log_record();

        assert!(!record.is_success());
        assert_eq!(record.error_type.as_deref(), Some("ValidationError"));
        assert_eq!(record.request_top_k, 0);
    }
}
