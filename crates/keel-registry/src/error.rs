//! Registry error types

use keel_types::{HostId, ReplicaId, ReplicaState, SpecValidationError};
use thiserror::Error;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service {service} has no version {version}")]
    VersionNotFound { service: String, version: u64 },

    #[error("Replica not found: {0}")]
    ReplicaNotFound(ReplicaId),

    #[error("Replica already exists: {0}")]
    ReplicaAlreadyExists(ReplicaId),

    #[error("Host not found: {0}")]
    HostNotFound(HostId),

    #[error("Replica {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ReplicaId,
        from: ReplicaState,
        to: ReplicaState,
    },

    #[error("Invalid spec: {0}")]
    InvalidSpec(#[from] SpecValidationError),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;
