//! Placement error types

use keel_registry::RegistryError;
use keel_runtime::RuntimeError;
use thiserror::Error;

/// Placement errors
#[derive(Debug, Error)]
pub enum PlacementError {
    /// No host can take the replica. Never retried automatically.
    #[error("Service {service} v{version} replica {ordinal} is unschedulable: {reason}")]
    Unschedulable {
        service: String,
        version: u64,
        ordinal: u32,
        reason: String,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type for placement operations
pub type Result<T> = std::result::Result<T, PlacementError>;
