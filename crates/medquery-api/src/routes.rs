//! API route definitions
//!
//! Author: hephaex@gmail.com

use crate::handlers::{debug, health, query};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Create service routes
pub fn api_routes(debug_endpoints: bool) -> Router<Arc<AppState>> {
    let routes = Router::new()
        .route("/", get(health::health_check))
        .route("/health", get(health::health_check))
        .route("/query", post(query::query_handler));

    if debug_endpoints {
        routes.route("/debug/env", get(debug::debug_env))
    } else {
        routes
    }
}
