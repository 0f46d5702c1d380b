//! Rollout error types

use crate::state::StateStoreError;
use keel_health::HealthError;
use keel_placement::PlacementError;
use keel_types::{HostId, ReplicaId};
use std::time::Duration;
use thiserror::Error;

/// Rollout errors
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Batch failure that triggered the failure action
    #[error("Rollout of {service} v{version} failed: {reason}")]
    RolloutFailed {
        service: String,
        version: u64,
        reason: String,
    },

    /// Replica still unhealthy after its restart attempts
    #[error("Health check failed for {service} v{version} replica {replica} on {host} after {attempts} restart(s): {reason}")]
    HealthCheckFailed {
        service: String,
        version: u64,
        replica: ReplicaId,
        host: HostId,
        attempts: u32,
        reason: String,
    },

    /// Step rejected before any replica was touched
    #[error("Quorum violation for {service}: {healthy} healthy, quorum {quorum}")]
    QuorumViolation {
        service: String,
        healthy: u32,
        quorum: u32,
    },

    /// Plan rejected at submission
    #[error("Invalid rollout plan for {service}: {reason}")]
    InvalidPlan { service: String, reason: String },

    #[error("Placement error: {0}")]
    Placement(#[from] PlacementError),

    #[error("Health error: {0}")]
    Health(#[from] HealthError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Service not found: {0}")]
    NotFound(String),

    /// Batch did not reach terminal health within the monitor window
    #[error("{service}: {pending} replica(s) not healthy within {waited:?}")]
    Timeout {
        service: String,
        pending: usize,
        waited: Duration,
    },

    /// Superseded by a newer submission
    #[error("Rollout of {service} preempted by v{superseded_by}")]
    Preempted { service: String, superseded_by: u64 },

    #[error("State store error: {0}")]
    Storage(#[from] StateStoreError),
}

impl RolloutError {
    /// Quorum violations end in `paused` whatever the failure action
    pub fn is_quorum_violation(&self) -> bool {
        matches!(self, RolloutError::QuorumViolation { .. })
    }
}

/// Result type for rollout operations
pub type Result<T> = std::result::Result<T, RolloutError>;
