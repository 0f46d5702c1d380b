//! Replica instances and their health
//!
//! Only the placement engine mutates a ReplicaInstance; every other
//! component works from snapshots.

use crate::{HostId, ReplicaId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Assigned to a host, not yet started
    Pending,
    /// Running, health not yet established
    Starting,
    Healthy,
    Unhealthy,
    /// Stopped; kept only until the store prunes it
    Terminated,
}

impl ReplicaState {
    /// Running replicas count towards the desired replica set
    pub fn is_live(&self) -> bool {
        !matches!(self, ReplicaState::Terminated)
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// Healthy and unhealthy may alternate; re-entry to `starting` happens
    /// only through a restart.
    pub fn can_transition_to(&self, next: ReplicaState) -> bool {
        use ReplicaState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Terminated)
                | (Starting, Healthy)
                | (Starting, Unhealthy)
                | (Starting, Terminated)
                | (Healthy, Unhealthy)
                | (Healthy, Terminated)
                | (Unhealthy, Healthy)
                | (Unhealthy, Starting)
                | (Unhealthy, Terminated)
        )
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaState::Pending => "pending",
            ReplicaState::Starting => "starting",
            ReplicaState::Healthy => "healthy",
            ReplicaState::Unhealthy => "unhealthy",
            ReplicaState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Health verdict produced by the health supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not yet verified (grace period or no successful probe yet)
    Starting,
    Healthy,
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HealthStatus::Starting)
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Replica state this verdict maps onto
    pub fn as_replica_state(&self) -> ReplicaState {
        match self {
            HealthStatus::Starting => ReplicaState::Starting,
            HealthStatus::Healthy => ReplicaState::Healthy,
            HealthStatus::Unhealthy { .. } => ReplicaState::Unhealthy,
        }
    }
}

/// One running copy of a service spec version on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInstance {
    pub id: ReplicaId,
    pub service: String,
    pub version: u64,
    /// Stable slot index in `0..replicas`; rollouts replace by ordinal
    pub ordinal: u32,
    pub host: HostId,
    pub state: ReplicaState,
    /// Endpoint address (`host:port` base) once started
    pub address: Option<String>,
    pub restarts: u32,
    /// Memory reserved on the host for this replica
    pub memory_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicaInstance {
    pub fn new(
        service: impl Into<String>,
        version: u64,
        ordinal: u32,
        host: HostId,
        memory_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReplicaId::generate(),
            service: service.into(),
            version,
            ordinal,
            host,
            state: ReplicaState::Pending,
            address: None,
            restarts: 0,
            memory_bytes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_healthy(&self) -> bool {
        self.state == ReplicaState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ReplicaState::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Healthy));
        assert!(Unhealthy.can_transition_to(Starting));
        assert!(!Healthy.can_transition_to(Starting));
        assert!(!Terminated.can_transition_to(Starting));
        assert!(!Terminated.is_live());
    }

    #[test]
    fn test_health_status_terminal() {
        assert!(!HealthStatus::Starting.is_terminal());
        assert!(HealthStatus::Healthy.is_terminal());
        let unhealthy = HealthStatus::Unhealthy {
            reason: "exit 1".into(),
        };
        assert!(unhealthy.is_terminal());
        assert_eq!(unhealthy.as_replica_state(), ReplicaState::Unhealthy);
    }

    #[test]
    fn test_new_replica_is_pending() {
        let replica = ReplicaInstance::new("es-master", 1, 0, HostId::new("es01"), 1024);
        assert_eq!(replica.state, ReplicaState::Pending);
        assert!(replica.is_live());
        assert!(!replica.is_healthy());
    }
}
