//! API route handlers

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::SharedState;
use crate::allocation::AllocationConfig;
use crate::error::{RegistryError, Result};
use crate::heartbeat::{HeartbeatOutcome, HeartbeatView};
use crate::registry::{RegisterRequest, ServiceFilter};
use crate::types::{Conflict, ServiceRegistration, ServiceStatus};

fn bad_request(rejection: impl std::fmt::Display) -> RegistryError {
    RegistryError::BadRequest(rejection.to_string())
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

// === Registrations ===

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub service_id: String,
    pub ip: IpAddr,
    pub port: u16,
    pub endpoint: String,
    pub status: ServiceStatus,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl From<ServiceRegistration> for RegisterResponse {
    fn from(reg: ServiceRegistration) -> Self {
        Self {
            endpoint: reg.endpoint_url(),
            service_id: reg.service_id,
            ip: reg.ip,
            port: reg.port,
            status: reg.status,
            fallback: reg.fallback,
            fallback_reason: reg.fallback_reason,
        }
    }
}

/// POST /register
pub async fn register(
    State(registry): State<SharedState>,
    body: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>> {
    let Json(request) = body.map_err(bad_request)?;
    let reg = registry.register(request).await?;
    Ok(Json(reg.into()))
}

#[derive(Debug, Deserialize)]
pub struct DeregisterRequest {
    pub service_id: String,
}

#[derive(Debug, Serialize)]
pub struct DeregisterResponse {
    pub status: &'static str,
    pub service_id: String,
}

/// POST /deregister
pub async fn deregister(
    State(registry): State<SharedState>,
    body: std::result::Result<Json<DeregisterRequest>, JsonRejection>,
) -> Result<Json<DeregisterResponse>> {
    let Json(request) = body.map_err(bad_request)?;
    let removed = registry.deregister(&request.service_id).await?;
    Ok(Json(DeregisterResponse {
        status: "ok",
        service_id: removed.service_id,
    }))
}

/// GET /services
pub async fn list_services(
    State(registry): State<SharedState>,
    filter: std::result::Result<Query<ServiceFilter>, QueryRejection>,
) -> Result<Json<Vec<ServiceRegistration>>> {
    let Query(filter) = filter.map_err(bad_request)?;
    Ok(Json(registry.list(&filter).await))
}

/// GET /services/:service_id
pub async fn get_service(
    State(registry): State<SharedState>,
    Path(service_id): Path<String>,
) -> Result<Json<ServiceRegistration>> {
    Ok(Json(registry.get(&service_id).await?))
}

#[derive(Debug, Serialize)]
pub struct EndpointResponse {
    pub service_id: String,
    pub endpoint: String,
}

/// GET /services/:service_id/endpoint
pub async fn service_endpoint(
    State(registry): State<SharedState>,
    Path(service_id): Path<String>,
) -> Result<Json<EndpointResponse>> {
    let endpoint = registry.endpoint(&service_id).await?;
    Ok(Json(EndpointResponse {
        service_id,
        endpoint,
    }))
}

// === Liveness ===

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub service_id: String,
    /// When the service sent the heartbeat; defaults to receipt time
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// POST /heartbeat
pub async fn heartbeat(
    State(registry): State<SharedState>,
    body: std::result::Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<HeartbeatOutcome>> {
    let Json(request) = body.map_err(bad_request)?;
    let at = request.timestamp.unwrap_or_else(Utc::now);
    Ok(Json(registry.heartbeat(&request.service_id, at).await?))
}

/// GET /heartbeats
pub async fn list_heartbeats(State(registry): State<SharedState>) -> Json<Vec<HeartbeatView>> {
    Json(registry.heartbeats(Utc::now()).await)
}

// === Conflicts ===

#[derive(Debug, Default, Deserialize)]
pub struct ConflictQuery {
    #[serde(default)]
    pub include_resolved: bool,
    /// Run a scan before answering instead of reading the cache
    #[serde(default)]
    pub refresh: bool,
}

/// GET /conflicts
pub async fn list_conflicts(
    State(registry): State<SharedState>,
    query: std::result::Result<Query<ConflictQuery>, QueryRejection>,
) -> Result<Json<Vec<Conflict>>> {
    let Query(query) = query.map_err(bad_request)?;
    if query.refresh {
        registry.scan_conflicts().await;
    }
    Ok(Json(registry.conflicts(query.include_resolved).await))
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub solution_index: usize,
}

/// POST /conflicts/:conflict_id/resolve
pub async fn resolve_conflict(
    State(registry): State<SharedState>,
    Path(conflict_id): Path<String>,
    body: std::result::Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<Conflict>> {
    let Json(request) = body.map_err(bad_request)?;
    let conflict = registry
        .resolve_conflict(&conflict_id, request.solution_index)
        .await?;
    Ok(Json(conflict))
}

// === Config ===

/// GET /config
pub async fn get_config(State(registry): State<SharedState>) -> Json<AllocationConfig> {
    Json((*registry.get_config().await).clone())
}

/// POST /config
pub async fn update_config(
    State(registry): State<SharedState>,
    body: std::result::Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<AllocationConfig>> {
    let Json(patch) = body.map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;
    let updated = registry.update_config(patch).await?;
    Ok(Json((*updated).clone()))
}
