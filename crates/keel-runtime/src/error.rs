//! Runtime error types

use keel_types::ReplicaId;
use std::time::Duration;
use thiserror::Error;

/// Runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Replica {replica} failed to start on {host}: {reason}")]
    StartFailed {
        replica: ReplicaId,
        host: String,
        reason: String,
    },

    #[error("Replica not running: {0}")]
    NotRunning(ReplicaId),

    #[error("Config '{0}' is not available")]
    MissingConfig(String),

    #[error("Command in {replica} timed out after {timeout:?}")]
    Timeout { replica: ReplicaId, timeout: Duration },

    #[error("Runtime backend error: {0}")]
    Backend(String),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
