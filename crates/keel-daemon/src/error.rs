//! Error types for keel-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keel_certs::CertError;
use keel_control::ControlPlaneError;
use keel_edge::EdgeError;
use keel_placement::PlacementError;
use keel_registry::RegistryError;
use keel_rollout::RolloutError;
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("Edge error: {0}")]
    Edge(#[from] EdgeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Request conflicts with current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Spec, plan or descriptor rejected
    #[error("Validation error: {0}")]
    Validation(String),

    /// Upstream dependency (issuer, runtime) failed
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            ApiError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<ControlPlaneError> for ApiError {
    fn from(err: ControlPlaneError) -> Self {
        let message = err.to_string();
        match err {
            ControlPlaneError::NotFound(_)
            | ControlPlaneError::Registry(
                RegistryError::ServiceNotFound(_)
                | RegistryError::VersionNotFound { .. }
                | RegistryError::ReplicaNotFound(_)
                | RegistryError::HostNotFound(_),
            )
            | ControlPlaneError::Rollout(RolloutError::NotFound(_)) => ApiError::NotFound(message),

            ControlPlaneError::InvalidSpec(_)
            | ControlPlaneError::Descriptor(_)
            | ControlPlaneError::Registry(RegistryError::InvalidSpec(_))
            | ControlPlaneError::Rollout(RolloutError::InvalidPlan { .. })
            | ControlPlaneError::Edge(EdgeError::InvalidRule(_))
            | ControlPlaneError::Certificates(CertError::UnsupportedDomain(_)) => {
                ApiError::Validation(message)
            }

            ControlPlaneError::InvalidRequest(_)
            | ControlPlaneError::Rollout(
                RolloutError::InvalidState(_) | RolloutError::QuorumViolation { .. },
            )
            | ControlPlaneError::Placement(PlacementError::Unschedulable { .. }) => {
                ApiError::Conflict(message)
            }

            ControlPlaneError::Certificates(
                CertError::ChallengeFailed { .. } | CertError::Issuer(_),
            ) => ApiError::Upstream(message),

            _ => ApiError::Internal(message),
        }
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
