//! Batch execution for the rollout controller

use crate::batch::{batch_count, next_batch, pending_ordinals};
use crate::controller::{Converged, RolloutController, RolloutControl};
use crate::error::{Result, RolloutError};
use keel_health::HealthError;
use keel_types::{HealthStatus, HostId, KeelEvent, ReplicaId, RolloutPhase, RolloutStatus, ServiceSpec};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

impl RolloutController {
    /// Move every ordinal of `spec` onto `spec.version`, batch by batch.
    ///
    /// Preemption and pause requests are honoured between batches only.
    pub(crate) async fn converge(
        &self,
        spec: &Arc<ServiceSpec>,
        rolling_back: bool,
        control: &RolloutControl,
        status: &mut RolloutStatus,
    ) -> Result<Converged> {
        let tolerate_failures = !rolling_back
            && spec.rollout.effective_failure_action(spec.role) == keel_types::FailureAction::Continue;

        let mut pending = pending_ordinals(spec, &self.placement.snapshot());
        let total_batches = batch_count(pending.len(), spec.rollout.parallelism);
        let mut batch_no = 0;
        let mut failures = Vec::new();

        while !pending.is_empty() {
            if control.preempted() {
                return Ok(Converged::Preempted);
            }
            if control.pause_requested() {
                return Ok(Converged::Paused);
            }

            let snapshot = self.placement.snapshot();
            let batch = match next_batch(spec, &snapshot, &mut pending) {
                Ok(batch) => batch,
                Err(RolloutError::QuorumViolation {
                    service,
                    healthy,
                    quorum,
                }) => {
                    self.emit(
                        KeelEvent::QuorumViolation {
                            service: service.clone(),
                            healthy,
                            quorum,
                        },
                        status,
                    );
                    return Err(RolloutError::QuorumViolation {
                        service,
                        healthy,
                        quorum,
                    });
                }
                Err(e) => return Err(e),
            };

            batch_no += 1;
            status.phase = if rolling_back {
                RolloutPhase::RollingBack {
                    batch: batch_no,
                    total_batches: total_batches.max(batch_no),
                }
            } else {
                RolloutPhase::RollingOut {
                    batch: batch_no,
                    total_batches: total_batches.max(batch_no),
                }
            };
            self.save(status).await;

            match self.run_batch(spec, &batch).await {
                Ok(()) => {}
                Err(e) if tolerate_failures && !e.is_quorum_violation() => {
                    warn!(service = %spec.name, batch = batch_no, error = %e, "Batch failed, continuing");
                    status.last_error = Some(e.to_string());
                    failures.push(e.to_string());
                }
                Err(e) => return Err(e),
            }

            status.updated_replicas = self
                .placement
                .snapshot()
                .healthy_for(&spec.name)
                .filter(|r| r.version == spec.version)
                .count() as u32;
            self.save(status).await;

            info!(service = %spec.name, batch = batch_no, total_batches, "Batch completed");
            self.emit(
                KeelEvent::BatchCompleted {
                    service: spec.name.clone(),
                    batch: batch_no,
                    total_batches: total_batches.max(batch_no),
                },
                status,
            );
        }

        self.scale_down(spec).await?;
        Ok(Converged::Completed { failures })
    }

    /// Replace the replicas at `ordinals` and wait for the new ones to
    /// become healthy. Hosts are chosen before anything is stopped.
    #[instrument(skip(self, spec), fields(service = %spec.name, version = spec.version))]
    async fn run_batch(&self, spec: &Arc<ServiceSpec>, ordinals: &[u32]) -> Result<()> {
        let placements = self
            .placement
            .plan_replacements(spec, ordinals, self.pin_targets())
            .await?;

        let snapshot = self.placement.snapshot();
        let outgoing: Vec<ReplicaId> = snapshot
            .for_service(&spec.name)
            .filter(|r| ordinals.contains(&r.ordinal))
            .map(|r| r.id.clone())
            .collect();
        for id in &outgoing {
            self.health.unregister(id);
            self.placement.stop_replica(id).await?;
        }

        let mut started = Vec::with_capacity(placements.len());
        for placement in &placements {
            let replica = self.placement.start_replica(Arc::clone(spec), placement).await?;
            self.health.register(&replica, spec.health.clone());
            started.push(replica.id);
        }

        if !spec.rollout.delay.is_zero() {
            tokio::time::sleep(spec.rollout.delay).await;
        }

        self.await_batch(spec, &started).await
    }

    /// Wait for a batch to reach terminal health, restarting unhealthy
    /// members within the restart policy.
    async fn await_batch(&self, spec: &Arc<ServiceSpec>, ids: &[ReplicaId]) -> Result<()> {
        let restart = &spec.rollout.restart;
        let allowed = restart.allowed_restarts();
        let mut attempts: HashMap<ReplicaId, u32> = HashMap::new();

        loop {
            let verdicts = match self.health.wait_for_terminal(ids, spec.rollout.monitor).await {
                Ok(verdicts) => verdicts,
                Err(HealthError::Timeout { pending, waited }) => {
                    return Err(RolloutError::Timeout {
                        service: spec.name.clone(),
                        pending: pending.len(),
                        waited,
                    })
                }
                Err(e) => return Err(e.into()),
            };

            let failed: Vec<(ReplicaId, String)> = verdicts
                .into_iter()
                .filter_map(|(id, status)| match status {
                    HealthStatus::Unhealthy { reason } => Some((id, reason)),
                    _ => None,
                })
                .collect();
            if failed.is_empty() {
                return Ok(());
            }

            for (id, reason) in failed {
                let used = attempts.entry(id.clone()).or_default();
                if *used >= allowed {
                    let host = self
                        .placement
                        .snapshot()
                        .get(&id)
                        .map(|r| r.host.clone())
                        .unwrap_or_else(|| HostId::new("unknown"));
                    return Err(RolloutError::HealthCheckFailed {
                        service: spec.name.clone(),
                        version: spec.version,
                        replica: id,
                        host,
                        attempts: *used,
                        reason,
                    });
                }
                *used += 1;

                debug!(replica_id = %id, attempt = *used, %reason, "Restarting unhealthy replica");
                if !restart.delay.is_zero() {
                    tokio::time::sleep(restart.delay).await;
                }
                self.placement.restart_replica(&id, Arc::clone(spec)).await?;
                self.health.reset(&id)?;
            }
        }
    }

    async fn scale_down(&self, spec: &ServiceSpec) -> Result<()> {
        let snapshot = self.placement.snapshot();
        let surplus: Vec<ReplicaId> = snapshot
            .for_service(&spec.name)
            .filter(|r| r.ordinal >= spec.replicas)
            .map(|r| r.id.clone())
            .collect();
        for id in &surplus {
            info!(service = %spec.name, replica_id = %id, "Removing surplus replica");
            self.health.unregister(id);
            self.placement.stop_replica(id).await?;
        }
        Ok(())
    }
}
