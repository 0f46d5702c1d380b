//! Keel Types - Core types for fleet orchestration
//!
//! Keel places role-differentiated service replicas across a fleet of hosts
//! and exposes a subset of them through a TLS-terminating edge router. This
//! crate holds the data model every other Keel crate speaks.
//!
//! ## Key Concepts
//!
//! - **ServiceSpec**: versioned, immutable description of a service
//! - **Host**: fleet inventory entry the placement engine schedules onto
//! - **PlacementConstraint**: predicate over host attributes
//! - **ReplicaInstance**: one running copy of a spec version on a host
//! - **RolloutPlan**: how a spec moves from version N to N+1
//! - **RouteRule**: host-match rule exposed through the edge router
//! - **Certificate**: per-domain certificate served by the edge router
//! - **StackDescriptor**: YAML document lowered into service specs
//! - **Events**: unified operator-facing event stream

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod certificate;
pub mod constraint;
pub mod descriptor;
pub mod events;
pub mod host;
pub mod ids;
pub mod replica;
pub mod rollout;
pub mod route;
pub mod spec;
pub mod units;

// Re-export main types
pub use certificate::{Certificate, CertificateSummary, ChallengeType};
pub use constraint::{ConstraintOp, PlacementConstraint};
pub use descriptor::{DescriptorError, StackDescriptor};
pub use events::{EventEnvelope, EventSeverity, EventSource, KeelEvent};
pub use host::Host;
pub use ids::{HostId, ReplicaId, RolloutId};
pub use replica::{HealthStatus, ReplicaInstance, ReplicaState};
pub use rollout::{
    FailureAction, RestartCondition, RestartPolicy, RolloutPhase, RolloutPlan, RolloutStatus,
};
pub use route::{NetworkScope, RouteRule, Transport};
pub use spec::{
    HealthCheck, Mount, MountSource, ResourceLimits, Role, ServiceSpec, SpecValidationError,
    Ulimit,
};

/// Serde helper for Duration (milliseconds on the wire)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
