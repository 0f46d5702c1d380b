//! Main KeelControlPlane implementation
//!
//! The control plane is the single entry point for operator actions. A
//! submission flows registry -> rollout controller -> edge rules ->
//! certificate manager; the background loops started by [`KeelControlPlane::start`]
//! keep health, restarts, certificates and the routing table current.

use crate::config::ControlPlaneConfig;
use crate::error::{ControlPlaneError, Result};
use crate::events::{EventAggregator, EventQuery};
use crate::supervision::{ReconcileReport, RestartSupervisor};
use keel_certs::CertificateManager;
use keel_edge::{EdgeRouter, RouteSummary};
use keel_health::HealthSupervisor;
use keel_placement::PlacementEngine;
use keel_registry::{HostInventory, SpecRegistry, SubmitOutcome};
use keel_rollout::{RolloutController, RolloutRecord, SubmitDecision};
use keel_runtime::ConfigStore;
use keel_types::{
    CertificateSummary, EventEnvelope, EventSource, Host, HostId, KeelEvent, ReplicaInstance,
    ReplicaState, Role, RolloutStatus, RouteRule, ServiceSpec, StackDescriptor,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Outcome of submitting one service
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReport {
    pub service: String,
    pub version: u64,
    pub registry: SubmitOutcome,
    pub rollout: SubmitDecision,
}

/// Outcome of applying a stack descriptor
#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    pub configs: Vec<String>,
    pub services: Vec<SubmitReport>,
}

/// Operator view of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceView {
    pub name: String,
    pub role: Role,
    pub latest_version: u64,
    /// Version every replica was last brought to
    pub deployed_version: Option<u64>,
    pub desired_replicas: u32,
    pub running_replicas: usize,
    pub healthy_replicas: usize,
    pub rolling: bool,
    pub rollout: Option<RolloutStatus>,
    pub routes: Vec<RouteRule>,
}

/// Fleet-wide summary
#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneStatus {
    pub services: usize,
    pub hosts: usize,
    pub schedulable_hosts: usize,
    pub replicas: usize,
    pub healthy_replicas: usize,
    pub active_rollouts: usize,
    pub certificates: usize,
    pub route_generation: u64,
    pub routes: usize,
}

/// Unified control plane for all Keel operations
pub struct KeelControlPlane {
    pub(crate) config: ControlPlaneConfig,
    pub(crate) registry: Arc<dyn SpecRegistry>,
    pub(crate) hosts: Arc<dyn HostInventory>,
    pub(crate) configs: Arc<ConfigStore>,
    pub(crate) placement: Arc<PlacementEngine>,
    pub(crate) health: Arc<HealthSupervisor>,
    pub(crate) rollout: Arc<RolloutController>,
    pub(crate) certs: Arc<CertificateManager>,
    pub(crate) edge: Arc<EdgeRouter>,
    pub(crate) supervisor: Arc<RestartSupervisor>,
    pub(crate) events: EventAggregator,
}

impl KeelControlPlane {
    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn placement(&self) -> Arc<PlacementEngine> {
        Arc::clone(&self.placement)
    }

    pub fn health(&self) -> Arc<HealthSupervisor> {
        Arc::clone(&self.health)
    }

    pub fn rollout(&self) -> Arc<RolloutController> {
        Arc::clone(&self.rollout)
    }

    pub fn certificates_manager(&self) -> Arc<CertificateManager> {
        Arc::clone(&self.certs)
    }

    pub fn edge(&self) -> Arc<EdgeRouter> {
        Arc::clone(&self.edge)
    }

    pub fn supervisor(&self) -> Arc<RestartSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Subscribe to the unified event stream
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Start every background loop. All of them stop when `shutdown` flips
    /// to true; event forwarders stop when their sources close.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let handles = vec![
            self.events
                .spawn_forwarder(self.placement.subscribe_events(), "placement"),
            self.events.spawn_forwarder(self.rollout.subscribe(), "rollout"),
            self.events.spawn_forwarder(self.certs.subscribe(), "certificates"),
            self.events.spawn_forwarder(self.edge.subscribe(), "edge"),
            Arc::clone(&self.health).spawn_poll_loop(shutdown.clone()),
            Arc::clone(&self.certs).spawn_renewal_loop(shutdown.clone()),
            Arc::clone(&self.edge).spawn_rebuild_loop(shutdown.clone()),
            Arc::clone(&self.supervisor)
                .spawn_loop(self.config.supervise_interval, shutdown),
        ];
        info!(tasks = handles.len(), "Control plane started");
        handles
    }

    // ========== Service Operations ==========

    /// Register a spec and hand it to the rollout controller.
    ///
    /// The rollout plan is checked before anything is stored, so a rejected
    /// plan leaves no new version behind.
    #[instrument(skip(self, spec), fields(service = %spec.name))]
    pub async fn submit_service(&self, spec: ServiceSpec) -> Result<SubmitReport> {
        spec.validate()?;
        keel_rollout::validate_plan(&spec)?;

        let service = spec.name.clone();
        let outcome = self.registry.submit(spec).await?;
        let version = outcome.version();
        let stored = self
            .registry
            .get(&service, version)
            .await?
            .ok_or_else(|| ControlPlaneError::service_not_found(&service))?;

        let event = if outcome.is_change() {
            KeelEvent::SpecSubmitted {
                service: service.clone(),
                version,
            }
        } else {
            KeelEvent::SpecUnchanged {
                service: service.clone(),
                version,
            }
        };
        self.events
            .publish(EventEnvelope::new(event, EventSource::Registry))
            .await;

        let decision = self.rollout.submit(stored).await?;
        self.sync_routes().await?;

        info!(version, decision = ?decision, "Service submitted");
        Ok(SubmitReport {
            service,
            version,
            registry: outcome,
            rollout: decision,
        })
    }

    /// Apply a YAML stack descriptor: configs first, then every service.
    ///
    /// All rollout plans are checked before the first submission.
    #[instrument(skip(self, yaml))]
    pub async fn apply_stack(&self, yaml: &str) -> Result<StackReport> {
        let stack = StackDescriptor::from_yaml(yaml)?;
        self.apply_descriptor(stack).await
    }

    pub async fn apply_descriptor(&self, stack: StackDescriptor) -> Result<StackReport> {
        for spec in &stack.services {
            spec.validate()?;
            keel_rollout::validate_plan(spec)?;
        }

        let configs: Vec<String> = stack.configs.keys().cloned().collect();
        for (name, content) in stack.configs {
            self.configs.put(name, content);
        }

        let mut services = Vec::with_capacity(stack.services.len());
        for spec in stack.services {
            services.push(self.submit_service(spec).await?);
        }
        info!(services = services.len(), configs = configs.len(), "Stack applied");
        Ok(StackReport { configs, services })
    }

    /// Stop every replica of a service and forget it
    #[instrument(skip(self))]
    pub async fn remove_service(&self, service: &str) -> Result<()> {
        if self.registry.latest(service).await?.is_none() {
            return Err(ControlPlaneError::service_not_found(service));
        }
        self.rollout.remove(service).await?;
        self.registry.remove(service).await?;
        self.sync_routes().await?;
        self.events
            .publish(EventEnvelope::new(
                KeelEvent::ServiceRemoved {
                    service: service.to_string(),
                },
                EventSource::Registry,
            ))
            .await;
        info!("Service removed");
        Ok(())
    }

    pub async fn get_service(&self, service: &str) -> Result<ServiceView> {
        let spec = self
            .registry
            .latest(service)
            .await?
            .ok_or_else(|| ControlPlaneError::service_not_found(service))?;
        self.view(spec).await
    }

    pub async fn list_services(&self) -> Result<Vec<ServiceView>> {
        let mut views = Vec::new();
        for spec in self.registry.list_latest().await? {
            views.push(self.view(spec).await?);
        }
        Ok(views)
    }

    /// Every stored version of a service, oldest first
    pub async fn service_history(&self, service: &str) -> Result<Vec<ServiceSpec>> {
        Ok(self.registry.history(service).await?)
    }

    async fn view(&self, spec: ServiceSpec) -> Result<ServiceView> {
        let snapshot = self.placement.snapshot();
        let running = snapshot.for_service(&spec.name).filter(|r| r.is_live()).count();
        let healthy = snapshot.healthy_for(&spec.name).count();
        let routes = spec.effective_routes()?;
        Ok(ServiceView {
            role: spec.role,
            latest_version: spec.version,
            deployed_version: self.rollout.deployed(&spec.name).map(|s| s.version),
            desired_replicas: spec.replicas,
            running_replicas: running,
            healthy_replicas: healthy,
            rolling: self.rollout.is_rolling(&spec.name),
            rollout: self.rollout.status(&spec.name).await?,
            routes,
            name: spec.name,
        })
    }

    // ========== Rollout Operations ==========

    pub async fn rollout_status(&self, service: &str) -> Result<RolloutStatus> {
        self.rollout
            .status(service)
            .await?
            .ok_or_else(|| ControlPlaneError::service_not_found(service))
    }

    pub async fn list_rollouts(&self) -> Result<Vec<RolloutStatus>> {
        Ok(self.rollout.list().await?)
    }

    pub async fn rollout_history(&self, service: &str) -> Result<Vec<RolloutRecord>> {
        Ok(self.rollout.history(service).await?)
    }

    /// Halt the service's rollout after its current batch
    pub fn pause(&self, service: &str) -> Result<()> {
        Ok(self.rollout.pause(service)?)
    }

    pub async fn resume(&self, service: &str) -> Result<()> {
        Ok(self.rollout.resume(service).await?)
    }

    /// Roll the service back to its previous version now. Returns the
    /// version being restored.
    pub async fn rollback(&self, service: &str) -> Result<u64> {
        Ok(self.rollout.force_rollback(service).await?)
    }

    // ========== Replica Operations ==========

    /// Replicas, optionally of one service, ordered by service then ordinal
    pub fn replicas(&self, service: Option<&str>) -> Vec<ReplicaInstance> {
        let snapshot = self.placement.snapshot();
        let mut replicas: Vec<ReplicaInstance> = snapshot
            .replicas
            .iter()
            .filter(|r| service.map_or(true, |s| r.service == s))
            .cloned()
            .collect();
        replicas.sort_by(|a, b| {
            (&a.service, a.ordinal, a.version).cmp(&(&b.service, b.ordinal, b.version))
        });
        replicas
    }

    // ========== Host Operations ==========

    pub async fn add_host(&self, host: Host) -> Result<()> {
        info!(host = %host.id, memory_bytes = host.memory_bytes, "Host added to inventory");
        Ok(self.hosts.upsert(host).await?)
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        Ok(self.hosts.list().await?)
    }

    /// Cordon (`false`) or uncordon a host. Running replicas stay put.
    pub async fn set_schedulable(&self, host: &HostId, schedulable: bool) -> Result<()> {
        Ok(self.hosts.set_schedulable(host, schedulable).await?)
    }

    /// Reconcile settled services against the current inventory now instead
    /// of at the next supervision tick
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.supervisor.reconcile_once().await
    }

    /// Remove a host that runs no live replica
    pub async fn remove_host(&self, host: &HostId) -> Result<()> {
        if self.hosts.get(host).await?.is_none() {
            return Err(ControlPlaneError::host_not_found(host));
        }
        let live = self
            .placement
            .snapshot()
            .live()
            .filter(|r| &r.host == host)
            .count();
        if live > 0 {
            return Err(ControlPlaneError::InvalidRequest(format!(
                "host {} still runs {} replica(s)",
                host, live
            )));
        }
        Ok(self.hosts.remove(host).await?)
    }

    // ========== Edge Operations ==========

    /// Recompute route rules from the latest spec of every service and
    /// request certificates for TLS hosts that lack one.
    pub async fn sync_routes(&self) -> Result<()> {
        let mut rules = Vec::new();
        for spec in self.registry.list_latest().await? {
            rules.extend(spec.effective_routes()?);
        }
        self.edge.set_rules(rules)?;

        if self.config.auto_certificates {
            let store = self.certs.store();
            let missing: BTreeSet<String> = self
                .edge
                .tls_hosts()
                .into_iter()
                .filter(|host| store.snapshot().valid(host).is_none())
                .collect();
            for domain in missing {
                let certs = Arc::clone(&self.certs);
                tokio::spawn(async move {
                    if let Err(e) = certs.ensure(&domain).await {
                        warn!(%domain, error = %e, "Certificate request failed");
                    }
                });
            }
        }
        Ok(())
    }

    pub fn routes(&self) -> Vec<RouteSummary> {
        self.edge.routes()
    }

    // ========== Certificate Operations ==========

    pub fn certificates(&self) -> Vec<CertificateSummary> {
        self.certs.certificates()
    }

    /// Obtain or renew the certificate for `domain` and wait for it
    pub async fn ensure_certificate(&self, domain: &str) -> Result<CertificateSummary> {
        let cert = self.certs.ensure(domain).await?;
        Ok(cert.summary())
    }

    // ========== Status ==========

    pub async fn events(&self, query: &EventQuery) -> Vec<EventEnvelope> {
        self.events.recent(query).await
    }

    pub async fn status(&self) -> Result<ControlPlaneStatus> {
        let hosts = self.hosts.list().await?;
        let snapshot = self.placement.snapshot();
        let table = self.edge.table();
        Ok(ControlPlaneStatus {
            services: self.registry.list_latest().await?.len(),
            schedulable_hosts: hosts.iter().filter(|h| h.schedulable).count(),
            hosts: hosts.len(),
            replicas: snapshot.live().count(),
            healthy_replicas: snapshot
                .replicas
                .iter()
                .filter(|r| r.state == ReplicaState::Healthy)
                .count(),
            active_rollouts: self
                .rollout
                .list()
                .await?
                .iter()
                .filter(|s| s.phase.is_active())
                .count(),
            certificates: self.certs.store().snapshot().len(),
            route_generation: table.generation(),
            routes: table.summary().len(),
        })
    }
}
