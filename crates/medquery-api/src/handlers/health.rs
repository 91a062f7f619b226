//! Health check handlers
//!
//! Author: hephaex@gmail.com

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` or `error`
    #[schema(example = "ok")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// A log store connection string is configured
    pub configured: bool,
    /// A store session exists or could be opened
    pub handle_present: bool,
    /// Liveness ping outcome; absent when no ping was sent
    pub ping_ok: Option<bool>,
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub uptime_secs: u64,
    pub total_requests: u64,
}

/// Liveness and store readiness
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Log store reachable", body = HealthResponse),
        (status = 503, description = "Log store not configured or unreachable", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.probe().await;
    let healthy = report.is_healthy();
    let sink = state.sink();

    let response = HealthResponse {
        status: if healthy { "ok" } else { "error" }.to_string(),
        message: sink.filter(|_| healthy).map(|sink| {
            format!(
                "Successfully connected to log store ({}, {} connection policy).",
                sink.config().backend,
                sink.policy()
            )
        }),
        error: report.error.clone(),
        timestamp: Utc::now(),
        configured: sink.is_some(),
        handle_present: report.handle_present,
        ping_ok: report.ping_ok,
        latency_ms: report.latency_ms,
        policy: sink.map(|sink| sink.policy().to_string()),
        database: sink.map(|sink| sink.config().database.clone()),
        collection: sink.map(|sink| sink.config().collection.clone()),
        uptime_secs: state.uptime_secs(),
        total_requests: state.get_request_count(),
    };

    if healthy {
        (StatusCode::OK, Json(response))
    } else {
        tracing::warn!(error = ?response.error, "Health check failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
