//! Service specifications
//!
//! A ServiceSpec is immutable once submitted. Updates produce a new spec
//! with a higher version; the registry keeps the history.

use crate::{PlacementConstraint, RolloutPlan, RouteRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Role tag carried by a service. One spec type serves every role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Cluster coordinator (e.g. a dedicated coordinating node)
    Coordinator,
    /// Master-eligible node; needs a majority to elect
    Master,
    /// Data-bearing node
    #[default]
    Data,
    /// Service reachable through the edge router
    EdgeFacing,
}

impl Role {
    /// Roles whose rollouts must never proceed past a failed batch
    pub fn requires_quorum_safety(&self) -> bool {
        matches!(self, Role::Coordinator | Role::Master)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Master => "master",
            Role::Data => "data",
            Role::EdgeFacing => "edge-facing",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource ceilings applied to each replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Soft/hard ulimit pair; `-1` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    pub soft: i64,
    pub hard: i64,
}

impl Ulimit {
    pub fn unlimited() -> Self {
        Self { soft: -1, hard: -1 }
    }

    pub fn fixed(value: i64) -> Self {
        Self {
            soft: value,
            hard: value,
        }
    }

    fn is_consistent(&self) -> bool {
        match (self.soft, self.hard) {
            (_, -1) => self.soft >= -1,
            (-1, _) => false,
            (soft, hard) => soft >= 0 && soft <= hard,
        }
    }

    /// Whether a host ceiling (`-1` unlimited) can grant this ulimit
    pub fn fits_within(&self, ceiling: i64) -> bool {
        match (ceiling, self.hard) {
            (-1, _) => true,
            (_, -1) => false,
            (ceiling, hard) => hard <= ceiling,
        }
    }
}

/// Health check executed inside the replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Command argv; exit code 0 means healthy
    pub command: Vec<String>,

    #[serde(with = "crate::duration_serde")]
    pub interval: Duration,

    /// Upper bound on a single probe; a timeout counts as a failure
    #[serde(with = "crate::duration_serde")]
    pub timeout: Duration,

    /// Consecutive failures before the replica is declared unhealthy
    pub retries: u32,

    /// Grace window during which failures are not counted
    #[serde(with = "crate::duration_serde")]
    pub start_period: Duration,
}

impl HealthCheck {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            retries: 3,
            start_period: Duration::ZERO,
        }
    }

    /// Shell-form check, run through `/bin/sh -c`
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(vec!["/bin/sh".into(), "-c".into(), command.into()])
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

/// Where mount content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MountSource {
    /// Named config blob from the stack descriptor
    Config { name: String },
    /// Named volume managed by the runtime
    Volume { name: String },
    /// Host path
    Bind { path: String },
}

/// A config or volume mount inside the replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Validation failures for a service spec
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecValidationError {
    #[error("service name must not be empty")]
    EmptyName,

    #[error("service name '{0}' may only contain lowercase letters, digits, '-' and '_'")]
    InvalidName(String),

    #[error("service '{0}': image must not be empty")]
    EmptyImage(String),

    #[error("service '{0}': rollout parallelism must be at least 1")]
    ZeroParallelism(String),

    #[error("service '{service}': quorum {quorum} must be between 1 and replicas ({replicas})")]
    InvalidQuorum {
        service: String,
        quorum: u32,
        replicas: u32,
    },

    #[error("service '{service}': invalid healthcheck: {reason}")]
    InvalidHealthCheck { service: String, reason: String },

    #[error("service '{service}': ulimit '{name}' has soft {soft} above hard {hard}")]
    InvalidUlimit {
        service: String,
        name: String,
        soft: i64,
        hard: i64,
    },

    #[error("service '{service}': invalid route: {reason}")]
    InvalidRoute { service: String, reason: String },

    #[error("service '{service}': mount target '{target}' is used more than once")]
    DuplicateMountTarget { service: String, target: String },
}

/// Versioned description of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,

    /// Monotonic per service name; assigned by the registry on submit
    #[serde(default)]
    pub version: u64,

    pub image: String,

    #[serde(default)]
    pub role: Role,

    pub replicas: u32,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub ulimits: BTreeMap<String, Ulimit>,

    /// `None` means healthy once running
    #[serde(default)]
    pub health: Option<HealthCheck>,

    #[serde(default)]
    pub mounts: Vec<Mount>,

    #[serde(default)]
    pub constraints: Vec<PlacementConstraint>,

    /// Anti-affinity: at most this many replicas of the service per host
    #[serde(default)]
    pub max_replicas_per_host: Option<u32>,

    #[serde(default)]
    pub rollout: RolloutPlan,

    /// Routes declared directly, in addition to those derived from `edge.*` labels
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            image: image.into(),
            role: Role::default(),
            replicas: 1,
            resources: ResourceLimits::default(),
            ulimits: BTreeMap::new(),
            health: None,
            mounts: Vec::new(),
            constraints: Vec::new(),
            max_replicas_per_host: None,
            rollout: RolloutPlan::default(),
            routes: Vec::new(),
            labels: BTreeMap::new(),
            environment: BTreeMap::new(),
            submitted_at: Utc::now(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.resources.memory_bytes = Some(bytes);
        self
    }

    pub fn with_health(mut self, health: HealthCheck) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_constraint(mut self, constraint: PlacementConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_max_replicas_per_host(mut self, max: u32) -> Self {
        self.max_replicas_per_host = Some(max);
        self
    }

    pub fn with_rollout(mut self, rollout: RolloutPlan) -> Self {
        self.rollout = rollout;
        self
    }

    pub fn with_route(mut self, route: RouteRule) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Memory reserved per replica for capacity accounting
    pub fn memory_bytes(&self) -> u64 {
        self.resources.memory_bytes.unwrap_or(0)
    }

    /// Exact hostname every replica is pinned to, if any
    pub fn pinned_hostname(&self) -> Option<&str> {
        self.constraints
            .iter()
            .find_map(PlacementConstraint::pinned_hostname)
    }

    pub fn is_quorum_bearing(&self) -> bool {
        self.rollout.is_quorum_bearing()
    }

    /// Declared routes plus routes derived from `edge.*` labels
    pub fn effective_routes(&self) -> Result<Vec<RouteRule>, SpecValidationError> {
        let mut routes = self.routes.clone();
        let derived = RouteRule::from_labels(&self.name, &self.labels).map_err(|reason| {
            SpecValidationError::InvalidRoute {
                service: self.name.clone(),
                reason,
            }
        })?;
        routes.extend(derived);
        Ok(routes)
    }

    /// Content fingerprint that ignores version and submission time
    pub fn fingerprint(&self) -> String {
        let mut normalized = self.clone();
        normalized.version = 0;
        normalized.submitted_at = DateTime::<Utc>::default();

        let bytes = serde_json::to_vec(&normalized).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Check the spec for internal consistency
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.name.is_empty() {
            return Err(SpecValidationError::EmptyName);
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(SpecValidationError::InvalidName(self.name.clone()));
        }
        if self.image.trim().is_empty() {
            return Err(SpecValidationError::EmptyImage(self.name.clone()));
        }
        if self.rollout.parallelism == 0 {
            return Err(SpecValidationError::ZeroParallelism(self.name.clone()));
        }
        if let Some(quorum) = self.rollout.quorum {
            if quorum == 0 || quorum > self.replicas {
                return Err(SpecValidationError::InvalidQuorum {
                    service: self.name.clone(),
                    quorum,
                    replicas: self.replicas,
                });
            }
        }

        if let Some(health) = &self.health {
            let reason = if health.command.is_empty() {
                Some("command is empty")
            } else if health.retries == 0 {
                Some("retries must be at least 1")
            } else if health.timeout.is_zero() {
                Some("timeout must be positive")
            } else if health.interval.is_zero() {
                Some("interval must be positive")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(SpecValidationError::InvalidHealthCheck {
                    service: self.name.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        for (name, limit) in &self.ulimits {
            if !limit.is_consistent() {
                return Err(SpecValidationError::InvalidUlimit {
                    service: self.name.clone(),
                    name: name.clone(),
                    soft: limit.soft,
                    hard: limit.hard,
                });
            }
        }

        let mut targets = std::collections::BTreeSet::new();
        for mount in &self.mounts {
            if !targets.insert(mount.target.as_str()) {
                return Err(SpecValidationError::DuplicateMountTarget {
                    service: self.name.clone(),
                    target: mount.target.clone(),
                });
            }
        }

        for route in self.effective_routes()? {
            route
                .validate()
                .map_err(|reason| SpecValidationError::InvalidRoute {
                    service: self.name.clone(),
                    reason,
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    fn master() -> ServiceSpec {
        ServiceSpec::new("es-master", "registry.local/search:8.11")
            .with_role(Role::Master)
            .with_replicas(3)
            .with_memory(2 << 30)
    }

    #[test]
    fn test_fingerprint_ignores_version_and_time() {
        let a = master();
        let mut b = a.clone();
        b.version = 7;
        b.submitted_at = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = a.clone().with_replicas(4);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_validate_quorum_bounds() {
        let mut spec = master();
        spec.rollout.quorum = Some(4);
        assert!(matches!(
            spec.validate(),
            Err(SpecValidationError::InvalidQuorum { quorum: 4, .. })
        ));

        spec.rollout.quorum = Some(2);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_names_and_health() {
        assert_eq!(
            ServiceSpec::new("", "img").validate(),
            Err(SpecValidationError::EmptyName)
        );
        assert!(matches!(
            ServiceSpec::new("Bad Name", "img").validate(),
            Err(SpecValidationError::InvalidName(_))
        ));

        let spec = master().with_health(HealthCheck::new(vec![]));
        assert!(matches!(
            spec.validate(),
            Err(SpecValidationError::InvalidHealthCheck { .. })
        ));
    }

    #[test]
    fn test_ulimit_consistency() {
        assert!(Ulimit::unlimited().is_consistent());
        assert!(Ulimit::fixed(65536).is_consistent());
        assert!(!Ulimit { soft: 10, hard: 5 }.is_consistent());
        assert!(!Ulimit { soft: -1, hard: 5 }.is_consistent());

        assert!(Ulimit::unlimited().fits_within(-1));
        assert!(!Ulimit::unlimited().fits_within(65536));
        assert!(Ulimit::fixed(1024).fits_within(65536));
    }

    #[test]
    fn test_effective_routes_include_labels() {
        let spec = ServiceSpec::new("kibana", "kibana:8")
            .with_role(Role::EdgeFacing)
            .with_label("edge.enable", "true")
            .with_label("edge.host", "kibana-labs.example.com")
            .with_label("edge.port", "5601")
            .with_label("edge.tls", "true");

        let routes = spec.effective_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].host, "kibana-labs.example.com");
        assert_eq!(routes[0].transport, Transport::Https);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_role_serde_is_kebab_case() {
        let json = serde_json::to_string(&Role::EdgeFacing).unwrap();
        assert_eq!(json, "\"edge-facing\"");
        assert!(Role::Master.requires_quorum_safety());
        assert!(!Role::Data.requires_quorum_safety());
    }
}
