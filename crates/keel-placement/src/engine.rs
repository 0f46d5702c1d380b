//! Placement engine - single writer of replica instances

use crate::error::{PlacementError, Result};
use crate::plan::{self, Placement, PlacementPlan};
use keel_registry::{HostInventory, ReplicaStore};
use keel_runtime::{ConfigMount, ConfigStore, ContainerRuntime, StartRequest};
use keel_types::{
    EventEnvelope, EventSource, HealthStatus, KeelEvent, MountSource, ReplicaId, ReplicaInstance,
    ReplicaState, ServiceSpec,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Point-in-time view of every replica instance
#[derive(Debug, Clone, Default)]
pub struct ReplicaSnapshot {
    /// Bumped on every published change
    pub generation: u64,
    pub replicas: Vec<ReplicaInstance>,
}

impl ReplicaSnapshot {
    pub fn for_service<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a ReplicaInstance> {
        self.replicas.iter().filter(move |r| r.service == service)
    }

    /// Healthy replicas of a service, any version
    pub fn healthy_for<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a ReplicaInstance> {
        self.for_service(service).filter(|r| r.is_healthy())
    }

    pub fn get(&self, id: &ReplicaId) -> Option<&ReplicaInstance> {
        self.replicas.iter().find(|r| &r.id == id)
    }

    pub fn live(&self) -> impl Iterator<Item = &ReplicaInstance> {
        self.replicas.iter().filter(|r| r.is_live())
    }
}

/// Owns replica instances and drives the container runtime on request
pub struct PlacementEngine {
    replicas: Arc<dyn ReplicaStore>,
    hosts: Arc<dyn HostInventory>,
    runtime: Arc<dyn ContainerRuntime>,
    configs: Arc<ConfigStore>,
    /// Serializes writes so snapshots are published in order
    write_lock: Mutex<()>,
    generation: AtomicU64,
    snapshot_tx: watch::Sender<Arc<ReplicaSnapshot>>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl PlacementEngine {
    pub fn new(
        replicas: Arc<dyn ReplicaStore>,
        hosts: Arc<dyn HostInventory>,
        runtime: Arc<dyn ContainerRuntime>,
        configs: Arc<ConfigStore>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(ReplicaSnapshot::default()));
        let (event_tx, _) = broadcast::channel(4096);
        Self {
            replicas,
            hosts,
            runtime,
            configs,
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            snapshot_tx,
            event_tx,
        }
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        Arc::clone(&self.runtime)
    }

    pub fn host_inventory(&self) -> Arc<dyn HostInventory> {
        Arc::clone(&self.hosts)
    }

    pub fn config_store(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.configs)
    }

    /// Watch replica snapshots
    pub fn subscribe(&self) -> watch::Receiver<Arc<ReplicaSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<ReplicaSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// Subscribe to placement events
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    pub async fn get(&self, id: &ReplicaId) -> Result<Option<ReplicaInstance>> {
        Ok(self.replicas.get(id).await?)
    }

    pub async fn list_for_service(&self, service: &str) -> Result<Vec<ReplicaInstance>> {
        Ok(self.replicas.list_for_service(service).await?)
    }

    /// Compute the diff for `desired` against the current inventory and replicas
    #[instrument(skip(self, desired), fields(services = desired.len()))]
    pub async fn plan(&self, desired: &[ServiceSpec]) -> Result<PlacementPlan> {
        let hosts = self.hosts.list().await?;
        let current = self.replicas.list().await?;
        plan::reconcile(desired, &hosts, &current).map_err(|e| self.report(e))
    }

    /// Hosts for a batch of replacements of one service. `reserved` holds
    /// the hostnames other services are pinned to.
    #[instrument(skip(self, spec, reserved), fields(service = %spec.name, version = spec.version))]
    pub async fn plan_replacements(
        &self,
        spec: &ServiceSpec,
        ordinals: &[u32],
        reserved: BTreeSet<String>,
    ) -> Result<Vec<Placement>> {
        let hosts = self.hosts.list().await?;
        let current = self.replicas.list().await?;
        plan::plan_replacements(spec, ordinals, &hosts, &current, reserved).map_err(|e| self.report(e))
    }

    /// Start one replica as placed. The replica is recorded in `starting`.
    #[instrument(skip(self, spec, placement), fields(service = %placement.service, ordinal = placement.ordinal, host = %placement.host))]
    pub async fn start_replica(
        &self,
        spec: Arc<ServiceSpec>,
        placement: &Placement,
    ) -> Result<ReplicaInstance> {
        let _guard = self.write_lock.lock().await;

        let host = self
            .hosts
            .get(&placement.host)
            .await?
            .ok_or_else(|| keel_registry::RegistryError::HostNotFound(placement.host.clone()))?;

        let replica = ReplicaInstance::new(
            placement.service.clone(),
            placement.version,
            placement.ordinal,
            placement.host.clone(),
            placement.memory_bytes,
        );
        let id = replica.id.clone();
        self.replicas.insert(replica).await?;

        let started = match self.resolve_configs(&spec) {
            Ok(configs) => {
                self.runtime
                    .start(StartRequest {
                        replica: id.clone(),
                        spec: Arc::clone(&spec),
                        host,
                        ordinal: placement.ordinal,
                        configs,
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                warn!(replica_id = %id, error = %e, "Replica failed to start");
                self.replicas.remove(&id).await?;
                self.publish().await?;
                return Err(e.into());
            }
        };

        self.replicas.set_address(&id, handle.address).await?;
        let replica = self.replicas.set_state(&id, ReplicaState::Starting).await?;
        self.publish().await?;

        info!(replica_id = %id, version = placement.version, "Replica placed");
        self.emit(KeelEvent::ReplicaPlaced {
            replica_id: id,
            service: placement.service.clone(),
            version: placement.version,
            ordinal: placement.ordinal,
            host: placement.host.clone(),
        });

        Ok(replica)
    }

    /// Stop and forget a replica. Stopping an unknown replica is a no-op.
    #[instrument(skip(self), fields(replica_id = %id))]
    pub async fn stop_replica(&self, id: &ReplicaId) -> Result<Option<ReplicaInstance>> {
        let _guard = self.write_lock.lock().await;

        let Some(replica) = self.replicas.get(id).await? else {
            return Ok(None);
        };

        self.runtime.stop(id).await?;
        if replica.state != ReplicaState::Terminated {
            self.replicas.set_state(id, ReplicaState::Terminated).await?;
        }
        let removed = self.replicas.remove(id).await?;
        self.publish().await?;

        info!(service = %replica.service, host = %replica.host, "Replica stopped");
        self.emit(KeelEvent::ReplicaStopped {
            replica_id: id.clone(),
            service: replica.service.clone(),
            host: replica.host.clone(),
        });
        Ok(removed)
    }

    /// Restart a replica in place: same id, same host, back to `starting`.
    /// Returns the restart count after this restart.
    #[instrument(skip(self, spec), fields(replica_id = %id))]
    pub async fn restart_replica(&self, id: &ReplicaId, spec: Arc<ServiceSpec>) -> Result<u32> {
        let _guard = self.write_lock.lock().await;

        let replica = self
            .replicas
            .get(id)
            .await?
            .ok_or_else(|| keel_registry::RegistryError::ReplicaNotFound(id.clone()))?;
        let host = self
            .hosts
            .get(&replica.host)
            .await?
            .ok_or_else(|| keel_registry::RegistryError::HostNotFound(replica.host.clone()))?;

        self.runtime.stop(id).await?;
        if replica.state == ReplicaState::Healthy {
            self.replicas.set_state(id, ReplicaState::Unhealthy).await?;
        }

        let configs = self.resolve_configs(&spec)?;
        let handle = self
            .runtime
            .start(StartRequest {
                replica: id.clone(),
                spec,
                host,
                ordinal: replica.ordinal,
                configs,
            })
            .await?;

        self.replicas.set_address(id, handle.address).await?;
        if replica.state != ReplicaState::Starting {
            self.replicas.set_state(id, ReplicaState::Starting).await?;
        }
        let attempt = self.replicas.record_restart(id).await?;
        self.publish().await?;

        warn!(service = %replica.service, attempt, "Replica restarted");
        self.emit(KeelEvent::ReplicaRestarted {
            replica_id: id.clone(),
            service: replica.service,
            attempt,
        });
        Ok(attempt)
    }

    /// Record a health verdict. Returns the updated replica when its state
    /// changed; verdicts that would be an invalid transition are dropped.
    pub async fn record_health(
        &self,
        id: &ReplicaId,
        status: &HealthStatus,
    ) -> Result<Option<ReplicaInstance>> {
        let _guard = self.write_lock.lock().await;

        let Some(current) = self.replicas.get(id).await? else {
            return Ok(None);
        };
        let next = status.as_replica_state();
        if current.state == next {
            return Ok(None);
        }
        if !current.state.can_transition_to(next) {
            debug!(replica_id = %id, from = %current.state, to = %next, "Ignoring health verdict");
            return Ok(None);
        }

        let updated = self.replicas.set_state(id, next).await?;
        self.publish().await?;

        debug!(replica_id = %id, from = %current.state, to = %next, "Replica health changed");
        self.emit(KeelEvent::ReplicaHealthChanged {
            replica_id: id.clone(),
            service: current.service,
            old_state: current.state.to_string(),
            new_state: next.to_string(),
        });
        Ok(Some(updated))
    }

    /// Apply the parts of a plan that are not version swaps: every removal,
    /// and every addition that does not replace an older replica. Swaps are
    /// left to the rollout controller.
    #[instrument(skip(self, plan, specs), fields(additions = plan.additions.len(), removals = plan.removals.len()))]
    pub async fn apply(
        &self,
        plan: &PlacementPlan,
        specs: &BTreeMap<String, Arc<ServiceSpec>>,
    ) -> Result<Vec<ReplicaInstance>> {
        for removal in &plan.removals {
            debug!(replica_id = %removal.replica, reason = ?removal.reason, "Removing replica");
            self.stop_replica(&removal.replica).await?;
        }

        let mut started = Vec::new();
        for placement in plan.additions.iter().filter(|p| p.replaces.is_none()) {
            let spec = specs
                .get(&placement.service)
                .cloned()
                .ok_or_else(|| PlacementError::ServiceNotFound(placement.service.clone()))?;
            started.push(self.start_replica(spec, placement).await?);
        }
        Ok(started)
    }

    fn resolve_configs(&self, spec: &ServiceSpec) -> keel_runtime::Result<Vec<ConfigMount>> {
        spec.mounts
            .iter()
            .filter_map(|mount| match &mount.source {
                MountSource::Config { name } => Some((name, &mount.target)),
                _ => None,
            })
            .map(|(name, target)| {
                Ok(ConfigMount {
                    name: name.clone(),
                    target: target.clone(),
                    content: self.configs.resolve(name)?,
                })
            })
            .collect()
    }

    async fn publish(&self) -> Result<()> {
        let replicas = self.replicas.list().await?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshot_tx.send_replace(Arc::new(ReplicaSnapshot {
            generation,
            replicas,
        }));
        Ok(())
    }

    fn report(&self, error: PlacementError) -> PlacementError {
        if let PlacementError::Unschedulable {
            service,
            version,
            ordinal,
            reason,
        } = &error
        {
            warn!(%service, version, ordinal, %reason, "Replica unschedulable");
            self.emit(KeelEvent::Unschedulable {
                service: service.clone(),
                version: *version,
                ordinal: *ordinal,
                reason: reason.clone(),
            });
        }
        error
    }

    fn emit(&self, event: KeelEvent) {
        let _ = self
            .event_tx
            .send(EventEnvelope::new(event, EventSource::Placement));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_registry::{InMemoryHostInventory, InMemoryReplicaStore};
    use keel_runtime::SimulatedRuntime;
    use keel_types::{Host, Mount};

    const GIB: u64 = 1 << 30;

    fn engine(runtime: Arc<SimulatedRuntime>) -> PlacementEngine {
        let hosts = InMemoryHostInventory::with_hosts(vec![
            Host::new("es01", 8 * GIB).with_address("10.0.0.1"),
            Host::new("es02", 8 * GIB).with_address("10.0.0.2"),
        ]);
        PlacementEngine::new(
            Arc::new(InMemoryReplicaStore::new()),
            Arc::new(hosts),
            runtime,
            Arc::new(ConfigStore::new()),
        )
    }

    fn spec(version: u64, replicas: u32) -> ServiceSpec {
        let mut spec = ServiceSpec::new("web", "img").with_replicas(replicas).with_memory(GIB);
        spec.version = version;
        spec
    }

    fn spec_map(spec: &ServiceSpec) -> BTreeMap<String, Arc<ServiceSpec>> {
        BTreeMap::from([(spec.name.clone(), Arc::new(spec.clone()))])
    }

    #[tokio::test]
    async fn test_apply_starts_replicas_and_publishes() {
        let runtime = SimulatedRuntime::shared();
        let engine = engine(runtime.clone());
        let mut snapshots = engine.subscribe();
        let mut events = engine.subscribe_events();

        let desired = spec(1, 2);
        let plan = engine.plan(std::slice::from_ref(&desired)).await.unwrap();
        let started = engine.apply(&plan, &spec_map(&desired)).await.unwrap();

        assert_eq!(started.len(), 2);
        assert!(started.iter().all(|r| r.state == ReplicaState::Starting));
        assert_eq!(runtime.running().len(), 2);

        assert!(snapshots.has_changed().unwrap());
        let snapshot = snapshots.borrow_and_update().clone();
        assert_eq!(snapshot.for_service("web").count(), 2);
        assert!(snapshot.generation >= 2);

        let event = events.recv().await.unwrap();
        assert!(matches!(event.event, KeelEvent::ReplicaPlaced { .. }));

        // applying again changes nothing
        let plan = engine.plan(std::slice::from_ref(&desired)).await.unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_leaves_no_replica() {
        let runtime = SimulatedRuntime::shared();
        runtime.fail_starts("web", None, "image pull failed");
        let engine = engine(runtime.clone());

        let desired = spec(1, 1);
        let plan = engine.plan(std::slice::from_ref(&desired)).await.unwrap();
        let err = engine.apply(&plan, &spec_map(&desired)).await.unwrap_err();

        assert!(matches!(err, PlacementError::Runtime(_)));
        assert!(engine.list_for_service("web").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_config_fails_start() {
        let runtime = SimulatedRuntime::shared();
        let engine = engine(runtime.clone());
        let mut desired = spec(1, 1);
        desired.mounts.push(Mount {
            source: MountSource::Config { name: "es_config".into() },
            target: "/etc/search/search.yml".into(),
            read_only: true,
        });

        let plan = engine.plan(std::slice::from_ref(&desired)).await.unwrap();
        assert!(engine.apply(&plan, &spec_map(&desired)).await.is_err());

        engine.config_store().put("es_config", b"cluster.name: labs".to_vec());
        let started = engine.apply(&plan, &spec_map(&desired)).await.unwrap();
        let mounted = runtime
            .mounted_config(&started[0].id, "/etc/search/search.yml")
            .unwrap();
        assert_eq!(&*mounted, b"cluster.name: labs");
    }

    #[tokio::test]
    async fn test_health_and_restart_lifecycle() {
        let runtime = SimulatedRuntime::shared();
        let engine = engine(runtime.clone());
        let desired = spec(1, 1);
        let plan = engine.plan(std::slice::from_ref(&desired)).await.unwrap();
        let replica = engine.apply(&plan, &spec_map(&desired)).await.unwrap().remove(0);

        let updated = engine
            .record_health(&replica.id, &HealthStatus::Healthy)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, ReplicaState::Healthy);

        // repeated verdict is not a change
        assert!(engine
            .record_health(&replica.id, &HealthStatus::Healthy)
            .await
            .unwrap()
            .is_none());

        // healthy -> starting is not a valid transition
        assert!(engine
            .record_health(&replica.id, &HealthStatus::Starting)
            .await
            .unwrap()
            .is_none());

        let attempt = engine
            .restart_replica(&replica.id, Arc::new(desired.clone()))
            .await
            .unwrap();
        assert_eq!(attempt, 1);
        let restarted = engine.get(&replica.id).await.unwrap().unwrap();
        assert_eq!(restarted.state, ReplicaState::Starting);
        assert_eq!(restarted.host, replica.host);
        assert!(runtime.is_running(&replica.id));
    }

    #[tokio::test]
    async fn test_scale_down_removes_highest_ordinals() {
        let runtime = SimulatedRuntime::shared();
        let engine = engine(runtime.clone());
        let three = spec(1, 3);
        let plan = engine.plan(std::slice::from_ref(&three)).await.unwrap();
        engine.apply(&plan, &spec_map(&three)).await.unwrap();

        let one = spec(1, 1);
        let plan = engine.plan(std::slice::from_ref(&one)).await.unwrap();
        assert_eq!(plan.removals.len(), 2);
        engine.apply(&plan, &spec_map(&one)).await.unwrap();

        let remaining = engine.list_for_service("web").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ordinal, 0);
        assert_eq!(runtime.stop_count(), 2);
        assert!(engine.stop_replica(&ReplicaId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unschedulable_is_reported() {
        let runtime = SimulatedRuntime::shared();
        let engine = engine(runtime);
        let mut events = engine.subscribe_events();

        let huge = spec(1, 1).with_memory(64 * GIB);
        assert!(engine.plan(&[huge]).await.is_err());
        let event = events.recv().await.unwrap();
        assert!(matches!(event.event, KeelEvent::Unschedulable { .. }));
    }
}
