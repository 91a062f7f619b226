//! MedQuery API - HTTP server
//!
//! Accepts medical queries, answers them with the configured generator and
//! logs every request to the document store.
//!
//! Author: hephaex@gmail.com

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

use crate::state::AppState;
use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// OpenAPI document
#[derive(OpenApi)]
#[openapi(
    info(
        title = "RAG Medical Query API",
        description = "An API to get answers and contexts for medical questions."
    ),
    paths(
        handlers::health::health_check,
        handlers::query::query_handler,
        handlers::debug::debug_env,
    ),
    components(schemas(
        medquery_core::QueryRequest,
        medquery_core::QueryResponse,
        medquery_core::FieldError,
        error::ApiError,
        handlers::health::HealthResponse,
        handlers::debug::DebugEnvResponse,
    )),
    tags(
        (name = "health", description = "Service and log store status"),
        (name = "query", description = "Medical queries"),
        (name = "debug", description = "Operational troubleshooting")
    )
)]
pub struct ApiDoc;

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    routes::api_routes(state.config.server.debug_endpoints)
        .route("/api-docs/openapi.json", get(openapi_json))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS for the configured origins; same-origin only when none are set
fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

/// Router over an unconfigured state, as a fresh process without
/// `MONGO_URI` would serve
#[cfg(feature = "test-utils")]
pub fn create_router_for_testing() -> Router {
    create_router(Arc::new(AppState::default()))
}
