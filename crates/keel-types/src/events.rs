//! Event types for Keel observability
//!
//! Events provide a unified stream of placement, rollout, health, certificate
//! and routing activity. Operator-visible failures are always published here.

use crate::{HostId, ReplicaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all Keel events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Event source
    pub source: EventSource,

    /// Event severity
    pub severity: EventSeverity,

    /// Correlation ID for tracing (usually the rollout ID)
    pub correlation_id: Option<String>,

    /// The actual event
    pub event: KeelEvent,
}

/// Event sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Registry,
    Placement,
    Health,
    Rollout,
    Certificates,
    Edge,
    ControlPlane,
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
    /// Requires operator intervention
    Critical,
}

/// Keel events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeelEvent {
    // Registry
    SpecSubmitted {
        service: String,
        version: u64,
    },
    SpecUnchanged {
        service: String,
        version: u64,
    },
    ServiceRemoved {
        service: String,
    },

    // Placement
    ReplicaPlaced {
        replica_id: ReplicaId,
        service: String,
        version: u64,
        ordinal: u32,
        host: HostId,
    },
    ReplicaStopped {
        replica_id: ReplicaId,
        service: String,
        host: HostId,
    },
    Unschedulable {
        service: String,
        version: u64,
        ordinal: u32,
        reason: String,
    },

    // Health
    ReplicaHealthChanged {
        replica_id: ReplicaId,
        service: String,
        old_state: String,
        new_state: String,
    },
    ReplicaRestarted {
        replica_id: ReplicaId,
        service: String,
        attempt: u32,
    },

    // Rollout
    RolloutStarted {
        service: String,
        from_version: Option<u64>,
        to_version: u64,
    },
    BatchCompleted {
        service: String,
        batch: u32,
        total_batches: u32,
    },
    RolloutCompleted {
        service: String,
        version: u64,
    },
    RolloutFailed {
        service: String,
        version: u64,
        reason: String,
    },
    RolloutPaused {
        service: String,
        reason: String,
    },
    RolloutResumed {
        service: String,
    },
    RolloutRolledBack {
        service: String,
        to_version: u64,
    },
    RolloutPreempted {
        service: String,
        superseded_by: u64,
    },
    QuorumViolation {
        service: String,
        healthy: u32,
        quorum: u32,
    },

    // Certificates
    CertificateIssued {
        domain: String,
        not_after: chrono::DateTime<chrono::Utc>,
    },
    CertificateRenewalScheduled {
        domain: String,
        expires_in_days: i64,
    },
    ChallengeFailed {
        domain: String,
        reason: String,
    },

    // Edge
    RouteTableRebuilt {
        generation: u64,
        hosts: usize,
    },
}

impl EventEnvelope {
    /// Create a new event envelope
    pub fn new(event: KeelEvent, source: EventSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            source,
            severity: Self::infer_severity(&event),
            correlation_id: None,
            event,
        }
    }

    /// Create with correlation ID
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Infer severity from event type
    fn infer_severity(event: &KeelEvent) -> EventSeverity {
        match event {
            KeelEvent::Unschedulable { .. }
            | KeelEvent::QuorumViolation { .. }
            | KeelEvent::ChallengeFailed { .. } => EventSeverity::Critical,

            KeelEvent::RolloutFailed { .. } => EventSeverity::Error,

            KeelEvent::RolloutPaused { .. }
            | KeelEvent::RolloutRolledBack { .. }
            | KeelEvent::RolloutPreempted { .. }
            | KeelEvent::ReplicaRestarted { .. } => EventSeverity::Warning,

            KeelEvent::RouteTableRebuilt { .. } | KeelEvent::SpecUnchanged { .. } => {
                EventSeverity::Debug
            }

            _ => EventSeverity::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_inference() {
        let env = EventEnvelope::new(
            KeelEvent::Unschedulable {
                service: "es-master".into(),
                version: 2,
                ordinal: 1,
                reason: "no host satisfies node.hostname == es09".into(),
            },
            EventSource::Placement,
        );
        assert_eq!(env.severity, EventSeverity::Critical);

        let env = EventEnvelope::new(
            KeelEvent::RolloutCompleted {
                service: "kibana".into(),
                version: 3,
            },
            EventSource::Rollout,
        )
        .with_correlation("rollout:1");
        assert_eq!(env.severity, EventSeverity::Info);
        assert_eq!(env.correlation_id.as_deref(), Some("rollout:1"));
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_value(KeelEvent::ServiceRemoved {
            service: "old".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "service_removed");
    }
}
