//! Supervision of settled services
//!
//! The rollout controller restarts members of the batch it is waiting on.
//! Outside a rollout, a replica that turns unhealthy is restarted here,
//! within its spec's restart policy. Once the attempts are used up the
//! replica stays unhealthy and the edge keeps routing around it.
//!
//! The same loop reconciles settled services against their deployed spec,
//! moving replicas off hosts that left the inventory or no longer satisfy
//! the spec's constraints.

use crate::error::Result;
use dashmap::{DashMap, DashSet};
use keel_health::HealthSupervisor;
use keel_placement::{PlacementEngine, PlacementPlan, RemovalReason};
use keel_registry::SpecRegistry;
use keel_rollout::RolloutController;
use keel_types::{Host, ReplicaId, ReplicaInstance, ReplicaState, ServiceSpec};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Replicas moved by one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<ReplicaId>,
    pub stopped: Vec<ReplicaId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Inputs of a reconcile pass that could not be planned
#[derive(Debug, PartialEq)]
struct StuckInputs {
    generation: u64,
    hosts: Vec<Host>,
    specs: Vec<(String, u64)>,
}

/// Restarts unhealthy replicas and reconciles placement of services that
/// are not rolling
pub struct RestartSupervisor {
    placement: Arc<PlacementEngine>,
    health: Arc<HealthSupervisor>,
    rollout: Arc<RolloutController>,
    registry: Arc<dyn SpecRegistry>,
    last_restart: DashMap<ReplicaId, Instant>,
    exhausted: DashSet<ReplicaId>,
    /// Set while the desired state is unschedulable; cleared when inputs change
    stuck: Mutex<Option<StuckInputs>>,
}

impl RestartSupervisor {
    pub fn new(
        placement: Arc<PlacementEngine>,
        health: Arc<HealthSupervisor>,
        rollout: Arc<RolloutController>,
        registry: Arc<dyn SpecRegistry>,
    ) -> Self {
        Self {
            placement,
            health,
            rollout,
            registry,
            last_restart: DashMap::new(),
            exhausted: DashSet::new(),
            stuck: Mutex::new(None),
        }
    }

    /// One supervision pass. Returns the replicas restarted.
    pub async fn supervise_once(&self) -> Result<Vec<ReplicaId>> {
        let snapshot = self.placement.snapshot();
        self.forget_gone(&snapshot.replicas);

        let mut restarted = Vec::new();
        for replica in snapshot
            .replicas
            .iter()
            .filter(|r| r.state == ReplicaState::Unhealthy)
        {
            if self.rollout.is_rolling(&replica.service) {
                continue;
            }
            let Some(spec) = self.registry.get(&replica.service, replica.version).await? else {
                continue;
            };

            let policy = &spec.rollout.restart;
            if replica.restarts >= policy.allowed_restarts() {
                if self.exhausted.insert(replica.id.clone()) {
                    warn!(
                        replica_id = %replica.id,
                        service = %replica.service,
                        host = %replica.host,
                        restarts = replica.restarts,
                        "Restart attempts exhausted, replica left unhealthy"
                    );
                }
                continue;
            }
            if let Some(last) = self.last_restart.get(&replica.id) {
                if last.elapsed() < policy.delay {
                    continue;
                }
            }

            let health = spec.health.clone();
            self.placement
                .restart_replica(&replica.id, Arc::new(spec))
                .await?;
            if self.health.reset(&replica.id).is_err() {
                self.health.register(replica, health);
            }
            self.last_restart.insert(replica.id.clone(), Instant::now());
            debug!(replica_id = %replica.id, "Unhealthy replica restarted");
            restarted.push(replica.id.clone());
        }
        Ok(restarted)
    }

    /// One reconcile pass over every settled service's deployed spec.
    ///
    /// Version swaps and service removal stay with the rollout controller;
    /// this pass only applies removals for hosts, constraints, scale and
    /// duplicates, plus fresh placements for the ordinals they free.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let deployed = self.rollout.deployed_specs();
        let desired: Vec<ServiceSpec> = deployed.iter().map(|s| ServiceSpec::clone(s)).collect();

        let inputs = StuckInputs {
            generation: self.placement.snapshot().generation,
            hosts: self.placement.host_inventory().list().await?,
            specs: desired.iter().map(|s| (s.name.clone(), s.version)).collect(),
        };
        if self.stuck.lock().await.as_ref() == Some(&inputs) {
            return Ok(ReconcileReport::default());
        }

        let plan = match self.placement.plan(&desired).await {
            Ok(plan) => plan,
            Err(e) => {
                *self.stuck.lock().await = Some(inputs);
                return Err(e.into());
            }
        };
        *self.stuck.lock().await = None;

        let settled = |service: &str| !self.rollout.is_rolling(service);
        let plan = PlacementPlan {
            additions: plan
                .additions
                .into_iter()
                .filter(|p| p.replaces.is_none() && settled(&p.service))
                .collect(),
            removals: plan
                .removals
                .into_iter()
                .filter(|r| r.reason != RemovalReason::ServiceRemoved && settled(&r.service))
                .collect(),
        };
        if plan.is_empty() {
            return Ok(ReconcileReport::default());
        }

        for removal in &plan.removals {
            info!(
                replica_id = %removal.replica,
                service = %removal.service,
                host = %removal.host,
                reason = ?removal.reason,
                "Replica leaves its host"
            );
            self.health.unregister(&removal.replica);
        }

        let specs: BTreeMap<String, Arc<ServiceSpec>> = deployed
            .iter()
            .map(|s| (s.name.clone(), Arc::clone(s)))
            .collect();
        let started = self.placement.apply(&plan, &specs).await?;
        for replica in &started {
            let check = specs.get(&replica.service).and_then(|s| s.health.clone());
            self.health.register(replica, check);
        }

        Ok(ReconcileReport {
            started: started.into_iter().map(|r| r.id).collect(),
            stopped: plan.removals.into_iter().map(|r| r.replica).collect(),
        })
    }

    fn forget_gone(&self, replicas: &[ReplicaInstance]) {
        let present = |id: &ReplicaId| replicas.iter().any(|r| &r.id == id);
        self.last_restart.retain(|id, _| present(id));
        self.exhausted.retain(|id| present(id));
    }

    /// Supervise every `interval` until shutdown
    pub fn spawn_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?interval, "Supervision loop started");

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.supervise_once().await {
                            warn!(error = %e, "Supervision pass failed");
                        }
                        match self.reconcile_once().await {
                            Ok(report) if !report.is_empty() => {
                                info!(started = report.started.len(), stopped = report.stopped.len(), "Placement reconciled");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Reconcile pass failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Supervision loop stopped");
        })
    }
}
