//! Error types for the control plane

use thiserror::Error;

/// Control plane error type
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Registry error: {0}")]
    Registry(#[from] keel_registry::RegistryError),

    #[error("Placement error: {0}")]
    Placement(#[from] keel_placement::PlacementError),

    #[error("Health error: {0}")]
    Health(#[from] keel_health::HealthError),

    #[error("Rollout error: {0}")]
    Rollout(#[from] keel_rollout::RolloutError),

    #[error("Certificate error: {0}")]
    Certificates(#[from] keel_certs::CertError),

    #[error("Edge error: {0}")]
    Edge(#[from] keel_edge::EdgeError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] keel_types::DescriptorError),

    #[error("Invalid spec: {0}")]
    InvalidSpec(#[from] keel_types::SpecValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

impl ControlPlaneError {
    pub fn service_not_found(service: &str) -> Self {
        Self::NotFound(format!("Service {}", service))
    }

    pub fn host_not_found(host: &keel_types::HostId) -> Self {
        Self::NotFound(format!("Host {}", host))
    }
}
