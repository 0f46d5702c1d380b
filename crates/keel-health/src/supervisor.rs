//! Health supervisor for registered replicas.
//!
//! Replicas are registered when they start and unregistered when they stop.
//! Each probe is bounded by its check timeout; waits are bounded by the
//! caller.

use crate::config::HealthConfig;
use crate::error::{HealthError, HealthResult};
use crate::probe::{run_probe, ProbeOutcome};
use crate::tracker::HealthTracker;
use dashmap::DashMap;
use futures::future::join_all;
use keel_placement::PlacementEngine;
use keel_types::{HealthCheck, HealthStatus, ReplicaId, ReplicaInstance};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Events emitted by the health supervisor.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// Replica registered for supervision.
    Registered { replica_id: ReplicaId, service: String },

    /// Replica no longer supervised.
    Unregistered(ReplicaId),

    /// One probe finished.
    ProbeCompleted {
        replica_id: ReplicaId,
        success: bool,
        consecutive_failures: u32,
    },

    /// Verdict changed.
    StatusChanged {
        replica_id: ReplicaId,
        service: String,
        old_status: HealthStatus,
        new_status: HealthStatus,
    },

    /// Tracker re-entered `starting`.
    Reset(ReplicaId),
}

#[derive(Debug)]
struct Supervised {
    service: String,
    tracker: HealthTracker,
}

/// Health supervisor.
pub struct HealthSupervisor {
    config: HealthConfig,
    placement: Arc<PlacementEngine>,
    replicas: DashMap<ReplicaId, Supervised>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl HealthSupervisor {
    pub fn new(config: HealthConfig, placement: Arc<PlacementEngine>) -> Self {
        let (event_tx, _) = broadcast::channel(4096);
        Self {
            config,
            placement,
            replicas: DashMap::new(),
            event_tx,
        }
    }

    /// Subscribe to health events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Start supervising a replica. Re-registering resets its tracker.
    #[instrument(skip(self, replica, check), fields(replica_id = %replica.id, service = %replica.service))]
    pub fn register(&self, replica: &ReplicaInstance, check: Option<HealthCheck>) {
        let tracker = HealthTracker::new(check, self.config.exit_check_interval, Instant::now());
        self.replicas.insert(
            replica.id.clone(),
            Supervised {
                service: replica.service.clone(),
                tracker,
            },
        );
        debug!("Registered replica for health supervision");
        let _ = self.event_tx.send(HealthEvent::Registered {
            replica_id: replica.id.clone(),
            service: replica.service.clone(),
        });
    }

    /// Stop supervising a replica.
    pub fn unregister(&self, id: &ReplicaId) {
        if self.replicas.remove(id).is_some() {
            debug!(replica_id = %id, "Unregistered replica");
            let _ = self.event_tx.send(HealthEvent::Unregistered(id.clone()));
        }
    }

    /// Re-enter `starting` after a restart in place.
    pub fn reset(&self, id: &ReplicaId) -> HealthResult<()> {
        let mut entry = self
            .replicas
            .get_mut(id)
            .ok_or_else(|| HealthError::NotRegistered(id.clone()))?;
        entry.tracker.reset(Instant::now());
        drop(entry);

        debug!(replica_id = %id, "Health tracker reset");
        let _ = self.event_tx.send(HealthEvent::Reset(id.clone()));
        Ok(())
    }

    pub fn is_registered(&self, id: &ReplicaId) -> bool {
        self.replicas.contains_key(id)
    }

    pub fn registered(&self) -> Vec<ReplicaId> {
        self.replicas.iter().map(|r| r.key().clone()).collect()
    }

    /// Current verdict without probing.
    pub fn status(&self, id: &ReplicaId) -> Option<HealthStatus> {
        self.replicas.get(id).map(|r| r.tracker.status().clone())
    }

    /// Probe now and return the resulting verdict.
    pub async fn observe(&self, id: &ReplicaId) -> HealthResult<HealthStatus> {
        let check = {
            let mut entry = self
                .replicas
                .get_mut(id)
                .ok_or_else(|| HealthError::NotRegistered(id.clone()))?;
            entry.tracker.claim(Instant::now());
            entry.tracker.check().cloned()
        };
        self.probe_and_record(id, check).await
    }

    /// Probe only if the replica's interval has elapsed; otherwise return the
    /// current verdict.
    pub async fn observe_if_due(&self, id: &ReplicaId) -> HealthResult<HealthStatus> {
        let check = {
            let mut entry = self
                .replicas
                .get_mut(id)
                .ok_or_else(|| HealthError::NotRegistered(id.clone()))?;
            let now = Instant::now();
            if !entry.tracker.is_due(now) {
                return Ok(entry.tracker.status().clone());
            }
            entry.tracker.claim(now);
            entry.tracker.check().cloned()
        };
        self.probe_and_record(id, check).await
    }

    async fn probe_and_record(
        &self,
        id: &ReplicaId,
        check: Option<HealthCheck>,
    ) -> HealthResult<HealthStatus> {
        let runtime = self.placement.runtime();
        let outcome = run_probe(runtime.as_ref(), id, check.as_ref()).await;

        let (service, previous, status, failures) = {
            let mut entry = self
                .replicas
                .get_mut(id)
                .ok_or_else(|| HealthError::NotRegistered(id.clone()))?;
            let previous = entry.tracker.record(&outcome, Instant::now());
            (
                entry.service.clone(),
                previous,
                entry.tracker.status().clone(),
                entry.tracker.consecutive_failures(),
            )
        };

        if !outcome.is_success() {
            debug!(replica_id = %id, %service, %outcome, consecutive_failures = failures, "Probe failed");
        }
        let _ = self.event_tx.send(HealthEvent::ProbeCompleted {
            replica_id: id.clone(),
            success: outcome.is_success(),
            consecutive_failures: failures,
        });

        if let Some(old_status) = previous {
            self.on_status_change(id, &service, old_status, &status, &outcome).await?;
        }
        Ok(status)
    }

    async fn on_status_change(
        &self,
        id: &ReplicaId,
        service: &str,
        old_status: HealthStatus,
        new_status: &HealthStatus,
        outcome: &ProbeOutcome,
    ) -> HealthResult<()> {
        match new_status {
            HealthStatus::Unhealthy { reason } => {
                warn!(replica_id = %id, %service, %reason, "Replica unhealthy")
            }
            _ => info!(replica_id = %id, %service, status = ?new_status, %outcome, "Replica health changed"),
        }

        self.placement.record_health(id, new_status).await?;
        let _ = self.event_tx.send(HealthEvent::StatusChanged {
            replica_id: id.clone(),
            service: service.to_string(),
            old_status,
            new_status: new_status.clone(),
        });
        Ok(())
    }

    /// Wait until every replica is healthy or unhealthy, probing as each
    /// becomes due. Fails with `Timeout` naming the replicas still unverified
    /// when `bound` elapses.
    #[instrument(skip(self, replicas), fields(replicas = replicas.len(), bound = ?bound))]
    pub async fn wait_for_terminal(
        &self,
        replicas: &[ReplicaId],
        bound: Duration,
    ) -> HealthResult<BTreeMap<ReplicaId, HealthStatus>> {
        let deadline = Instant::now() + bound;
        loop {
            let mut verdicts = BTreeMap::new();
            let mut pending = Vec::new();
            for id in replicas {
                let status = self.observe_if_due(id).await?;
                if status.is_terminal() {
                    verdicts.insert(id.clone(), status);
                } else {
                    pending.push(id.clone());
                }
            }
            if pending.is_empty() {
                return Ok(verdicts);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HealthError::Timeout {
                    pending,
                    waited: bound,
                });
            }

            let next_due = pending
                .iter()
                .filter_map(|id| self.replicas.get(id).map(|r| r.tracker.next_due()))
                .min()
                .unwrap_or(now);
            let wake = next_due.min(now + self.config.wait_poll).min(deadline).max(now);
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Probe every due replica once.
    pub async fn poll_once(&self) {
        let ids = self.registered();
        let results = join_all(ids.iter().map(|id| self.observe_if_due(id))).await;
        for (id, result) in ids.iter().zip(results) {
            match result {
                // unregistered mid-poll
                Err(HealthError::NotRegistered(_)) => {}
                Err(e) => warn!(replica_id = %id, error = %e, "Health poll failed"),
                Ok(_) => {}
            }
        }
    }

    /// Probe registered replicas on their own intervals until shutdown.
    pub fn spawn_poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.tick);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(tick = ?self.config.tick, "Health poll loop started");

            loop {
                tokio::select! {
                    _ = tick.tick() => self.poll_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Health poll loop stopped");
        })
    }
}
