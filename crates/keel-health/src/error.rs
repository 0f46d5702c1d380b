//! Error types for health supervision.

use keel_placement::PlacementError;
use keel_types::ReplicaId;
use std::time::Duration;
use thiserror::Error;

/// Errors from the health supervisor.
#[derive(Debug, Error)]
pub enum HealthError {
    /// Replica is not registered for supervision.
    #[error("Replica not registered: {0}")]
    NotRegistered(ReplicaId),

    /// Replicas still unverified when the wait bound elapsed.
    #[error("{} replica(s) not terminal after {waited:?}", pending.len())]
    Timeout {
        pending: Vec<ReplicaId>,
        waited: Duration,
    },

    /// Recording a verdict failed.
    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),
}

/// Result type for health operations.
pub type HealthResult<T> = Result<T, HealthError>;
