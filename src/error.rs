//! Error types for the registry
//!
//! Every handler-level failure is one of these kinds. Each carries a
//! human-readable message and maps to a fixed HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Main error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Service already registered: {0}")]
    DuplicateService(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No free port for service type '{service_type}'")]
    ExhaustedPortRange { service_type: String },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Solution index {index} out of range ({available} suggestions)")]
    InvalidIndex { index: usize, available: usize },

    #[error("Conflict {0} still present after remediation")]
    StillConflicting(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Stable kind name reported to API clients
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DuplicateService(_) => "DuplicateService",
            Self::NotFound(_) => "NotFound",
            Self::ExhaustedPortRange { .. } => "ExhaustedPortRange",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::InvalidIndex { .. } => "InvalidIndex",
            Self::StillConflicting(_) => "StillConflicting",
            Self::BadRequest(_) => "BadRequest",
            Self::Internal(_) => "Internal",
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateService(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ExhaustedPortRange { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Self::InvalidIndex { .. } => StatusCode::BAD_REQUEST,
            Self::StillConflicting(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body for error responses
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

/// Result type alias for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
