//! HTTP API
//!
//! JSON-over-HTTP surface used by registering services and by the operator
//! UI. Every handler shares the one [`Registry`] handle.

pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::registry::Registry;

pub type SharedState = Arc<Registry>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        // Registrations
        .route("/register", post(routes::register))
        .route("/deregister", post(routes::deregister))
        .route("/services", get(routes::list_services))
        .route("/services/:service_id", get(routes::get_service))
        .route("/services/:service_id/endpoint", get(routes::service_endpoint))
        // Liveness
        .route("/heartbeat", post(routes::heartbeat))
        .route("/heartbeats", get(routes::list_heartbeats))
        // Conflicts
        .route("/conflicts", get(routes::list_conflicts))
        .route("/conflicts/:conflict_id/resolve", post(routes::resolve_conflict))
        // Allocation config
        .route("/config", get(routes::get_config).post(routes::update_config))
        // Health check
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
