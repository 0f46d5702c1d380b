//! Rollout plan and rollout state types
//!
//! A RolloutPlan drives one service's transition from version N to N+1.
//! RolloutStatus is the observable state of that transition.

use crate::{RolloutId, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when a batch fails after exhausting restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Revert every replica to the previous spec version
    Rollback,
    /// Halt further batches for operator intervention
    #[default]
    Pause,
    /// Proceed regardless (non-quorum roles only)
    Continue,
}

/// When a failed replica is restarted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartCondition {
    /// Never restart
    None,
    /// Restart only replicas that failed
    OnFailure,
    /// Restart on any exit
    #[default]
    Any,
}

/// Restart policy applied to unhealthy replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub condition: RestartCondition,

    /// Delay between restart attempts
    #[serde(with = "crate::duration_serde")]
    pub delay: Duration,

    /// Restart attempts before the failure escalates
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            condition: RestartCondition::Any,
            delay: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

impl RestartPolicy {
    /// Number of restarts allowed for a failed replica
    pub fn allowed_restarts(&self) -> u32 {
        match self.condition {
            RestartCondition::None => 0,
            RestartCondition::OnFailure | RestartCondition::Any => self.max_attempts,
        }
    }
}

/// How a service's replica set moves between versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutPlan {
    /// Maximum replicas replaced per batch
    pub parallelism: u32,

    /// Wait after starting a batch before checking its health
    #[serde(with = "crate::duration_serde")]
    pub delay: Duration,

    /// Action applied when a batch fails
    pub failure_action: FailureAction,

    /// Upper bound on the wait for a batch to reach terminal health
    #[serde(with = "crate::duration_serde")]
    pub monitor: Duration,

    /// Restart policy for unhealthy batch members
    pub restart: RestartPolicy,

    /// Minimum simultaneously healthy replicas, for quorum-bearing roles.
    ///
    /// Always explicit; never derived from the replica count.
    #[serde(default)]
    pub quorum: Option<u32>,
}

impl Default for RolloutPlan {
    fn default() -> Self {
        Self {
            parallelism: 1,
            delay: Duration::ZERO,
            failure_action: FailureAction::Pause,
            monitor: Duration::from_secs(120),
            restart: RestartPolicy::default(),
            quorum: None,
        }
    }
}

impl RolloutPlan {
    pub fn is_quorum_bearing(&self) -> bool {
        self.quorum.is_some()
    }

    /// Failure action after applying role rules: quorum roles never `continue`
    pub fn effective_failure_action(&self, role: Role) -> FailureAction {
        match self.failure_action {
            FailureAction::Continue if self.is_quorum_bearing() || role.requires_quorum_safety() => {
                FailureAction::Pause
            }
            action => action,
        }
    }
}

/// Rollout state machine phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Nothing submitted yet
    Idle,
    /// Advancing batches towards the target version
    RollingOut { batch: u32, total_batches: u32 },
    /// Reverting to the previous version after a failure
    RollingBack { batch: u32, total_batches: u32 },
    /// Halted, waiting for an operator
    Paused { reason: String },
    /// All replicas on `version` and healthy
    Stable { version: u64 },
}

impl RolloutPhase {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RolloutPhase::RollingOut { .. } | RolloutPhase::RollingBack { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            RolloutPhase::Idle => "idle",
            RolloutPhase::RollingOut { .. } => "rolling_out",
            RolloutPhase::RollingBack { .. } => "rolling_back",
            RolloutPhase::Paused { .. } => "paused",
            RolloutPhase::Stable { .. } => "stable",
        }
    }
}

/// Observable state of a service's rollout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStatus {
    pub id: RolloutId,
    pub service: String,
    pub phase: RolloutPhase,
    /// Version being replaced, if any
    pub from_version: Option<u64>,
    /// Version being rolled out
    pub target_version: u64,
    /// Replicas already on the target version
    pub updated_replicas: u32,
    pub desired_replicas: u32,
    /// Most recent failure surfaced to the operator
    pub last_error: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl RolloutStatus {
    pub fn new(service: impl Into<String>, from: Option<u64>, target: u64, desired: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: RolloutId::generate(),
            service: service.into(),
            phase: RolloutPhase::Idle,
            from_version: from,
            target_version: target,
            updated_replicas: 0,
            desired_replicas: desired,
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }
}
