//! Batch selection and the quorum guard

use crate::error::{Result, RolloutError};
use keel_placement::ReplicaSnapshot;
use keel_types::{ReplicaState, ServiceSpec};
use std::collections::VecDeque;

/// Reject plans the quorum guard could never admit a batch for
pub fn validate_plan(spec: &ServiceSpec) -> Result<()> {
    let plan = &spec.rollout;
    let invalid = |reason: String| RolloutError::InvalidPlan {
        service: spec.name.clone(),
        reason,
    };

    if plan.parallelism == 0 {
        return Err(invalid("parallelism must be at least 1".into()));
    }
    if let Some(quorum) = plan.quorum {
        if quorum == 0 || quorum > spec.replicas {
            return Err(invalid(format!(
                "quorum {} must be between 1 and replicas ({})",
                quorum, spec.replicas
            )));
        }
        let spare = spec.replicas - quorum;
        if plan.parallelism > spare {
            return Err(invalid(format!(
                "parallelism {} exceeds replicas - quorum ({} - {} = {})",
                plan.parallelism, spec.replicas, quorum, spare
            )));
        }
    }
    Ok(())
}

/// Ordinals without a healthy replica of `spec`'s version, lowest first
pub fn pending_ordinals(spec: &ServiceSpec, snapshot: &ReplicaSnapshot) -> VecDeque<u32> {
    (0..spec.replicas)
        .filter(|ordinal| {
            !snapshot.for_service(&spec.name).any(|r| {
                r.ordinal == *ordinal && r.version == spec.version && r.state == ReplicaState::Healthy
            })
        })
        .collect()
}

/// Take the next batch off `pending`.
///
/// At most `parallelism` ordinals. For quorum-bearing plans only
/// `healthy - quorum` of them may currently hold a healthy replica; ordinals
/// whose replica is missing or unhealthy cost nothing. An empty batch is a
/// `QuorumViolation` and leaves `pending` untouched.
pub fn next_batch(
    spec: &ServiceSpec,
    snapshot: &ReplicaSnapshot,
    pending: &mut VecDeque<u32>,
) -> Result<Vec<u32>> {
    let parallelism = spec.rollout.parallelism.max(1) as usize;

    let Some(quorum) = spec.rollout.quorum else {
        let take = parallelism.min(pending.len());
        return Ok(pending.drain(..take).collect());
    };

    let healthy = snapshot.healthy_for(&spec.name).count() as u32;
    let mut budget = healthy.saturating_sub(quorum);
    let mut batch = Vec::new();

    while batch.len() < parallelism {
        let Some(&ordinal) = pending.front() else {
            break;
        };
        let takes_down_healthy = snapshot
            .healthy_for(&spec.name)
            .any(|r| r.ordinal == ordinal);
        if takes_down_healthy {
            if budget == 0 {
                break;
            }
            budget -= 1;
        }
        pending.pop_front();
        batch.push(ordinal);
    }

    if batch.is_empty() && !pending.is_empty() {
        return Err(RolloutError::QuorumViolation {
            service: spec.name.clone(),
            healthy,
            quorum,
        });
    }
    Ok(batch)
}

/// Batches needed for `pending` ordinals at full parallelism
pub fn batch_count(pending: usize, parallelism: u32) -> u32 {
    let parallelism = parallelism.max(1) as usize;
    pending.div_ceil(parallelism) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{HostId, ReplicaInstance, Role, RolloutPlan};

    fn master(version: u64, parallelism: u32, quorum: Option<u32>) -> ServiceSpec {
        let mut spec = ServiceSpec::new("es-master", "img")
            .with_role(Role::Master)
            .with_replicas(3)
            .with_rollout(RolloutPlan {
                parallelism,
                quorum,
                ..RolloutPlan::default()
            });
        spec.version = version;
        spec
    }

    fn snapshot(states: &[(u32, u64, ReplicaState)]) -> ReplicaSnapshot {
        let replicas = states
            .iter()
            .map(|(ordinal, version, state)| {
                let mut r = ReplicaInstance::new("es-master", *version, *ordinal, HostId::new(format!("es0{ordinal}")), 0);
                r.state = *state;
                r
            })
            .collect();
        ReplicaSnapshot {
            generation: 1,
            replicas,
        }
    }

    #[test]
    fn test_validate_plan() {
        assert!(validate_plan(&master(1, 1, Some(2))).is_ok());
        assert!(matches!(
            validate_plan(&master(1, 2, Some(2))),
            Err(RolloutError::InvalidPlan { .. })
        ));
        assert!(validate_plan(&master(1, 0, None)).is_err());
        assert!(validate_plan(&master(1, 3, None)).is_ok());
    }

    #[test]
    fn test_pending_skips_healthy_target_replicas() {
        let spec = master(2, 1, Some(2));
        let snap = snapshot(&[
            (0, 2, ReplicaState::Healthy),
            (1, 1, ReplicaState::Healthy),
            (2, 2, ReplicaState::Unhealthy),
        ]);
        assert_eq!(pending_ordinals(&spec, &snap), VecDeque::from(vec![1, 2]));
    }

    #[test]
    fn test_quorum_caps_batch() {
        let spec = ServiceSpec {
            replicas: 5,
            ..master(2, 2, Some(3))
        };
        let snap = snapshot(&[
            (0, 1, ReplicaState::Healthy),
            (1, 1, ReplicaState::Healthy),
            (2, 1, ReplicaState::Healthy),
            (3, 1, ReplicaState::Healthy),
        ]);
        let mut pending = pending_ordinals(&spec, &snap);
        // 4 healthy, quorum 3: only one healthy member may go
        let batch = next_batch(&spec, &snap, &mut pending).unwrap();
        assert_eq!(batch, vec![0]);
    }

    #[test]
    fn test_quorum_violation_touches_nothing() {
        let spec = master(2, 1, Some(2));
        let snap = snapshot(&[
            (0, 1, ReplicaState::Healthy),
            (1, 1, ReplicaState::Healthy),
            (2, 1, ReplicaState::Unhealthy),
        ]);
        let mut pending = VecDeque::from(vec![0, 1]);
        let err = next_batch(&spec, &snap, &mut pending).unwrap_err();
        assert!(matches!(err, RolloutError::QuorumViolation { healthy: 2, quorum: 2, .. }));
        assert_eq!(pending.len(), 2);

        // the dead member can still be replaced
        let mut pending = VecDeque::from(vec![2, 0]);
        assert_eq!(next_batch(&spec, &snap, &mut pending).unwrap(), vec![2]);
    }

    #[test]
    fn test_first_deployment_is_never_quorum_blocked() {
        let spec = master(1, 1, Some(2));
        let snap = ReplicaSnapshot::default();
        let mut pending = pending_ordinals(&spec, &snap);
        for expected in 0..3 {
            assert_eq!(next_batch(&spec, &snap, &mut pending).unwrap(), vec![expected]);
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(batch_count(3, 1), 3);
        assert_eq!(batch_count(5, 2), 3);
        assert_eq!(batch_count(0, 2), 0);
    }
}
