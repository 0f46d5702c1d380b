//! Builder for KeelControlPlane
//!
//! Every store and the certificate issuer can be swapped; anything left
//! unset gets the in-memory implementation.

use crate::config::ControlPlaneConfig;
use crate::control_plane::KeelControlPlane;
use crate::error::Result;
use crate::events::EventAggregator;
use crate::supervision::RestartSupervisor;
use keel_certs::{CertStore, CertificateManager, ChallengeResponder, Issuer, LocalAuthority};
use keel_edge::EdgeRouter;
use keel_health::HealthSupervisor;
use keel_placement::PlacementEngine;
use keel_registry::{
    HostInventory, InMemoryHostInventory, InMemoryReplicaStore, InMemorySpecRegistry,
    ReplicaStore, SpecRegistry,
};
use keel_rollout::{InMemoryRolloutStateStore, RolloutController, RolloutStateStore};
use keel_runtime::{ConfigStore, ContainerRuntime};
use keel_types::Host;
use std::sync::Arc;
use tracing::info;

/// Name of the bundled in-process certificate authority
pub const LOCAL_CA_NAME: &str = "keel-local-ca";

/// Builder for [`KeelControlPlane`]
pub struct KeelControlPlaneBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    config: ControlPlaneConfig,
    hosts: Vec<Host>,
    spec_registry: Option<Arc<dyn SpecRegistry>>,
    replica_store: Option<Arc<dyn ReplicaStore>>,
    host_inventory: Option<Arc<dyn HostInventory>>,
    rollout_store: Option<Arc<dyn RolloutStateStore>>,
    responder: Option<Arc<ChallengeResponder>>,
    issuer: Option<Arc<dyn Issuer>>,
}

impl KeelControlPlaneBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            config: ControlPlaneConfig::default(),
            hosts: Vec::new(),
            spec_registry: None,
            replica_store: None,
            host_inventory: None,
            rollout_store: None,
            responder: None,
            issuer: None,
        }
    }

    pub fn with_config(mut self, config: ControlPlaneConfig) -> Self {
        self.config = config;
        self
    }

    /// Hosts added to the inventory at build time
    pub fn with_hosts(mut self, hosts: impl IntoIterator<Item = Host>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn with_spec_registry(mut self, registry: Arc<dyn SpecRegistry>) -> Self {
        self.spec_registry = Some(registry);
        self
    }

    pub fn with_replica_store(mut self, store: Arc<dyn ReplicaStore>) -> Self {
        self.replica_store = Some(store);
        self
    }

    pub fn with_host_inventory(mut self, inventory: Arc<dyn HostInventory>) -> Self {
        self.host_inventory = Some(inventory);
        self
    }

    pub fn with_rollout_store(mut self, store: Arc<dyn RolloutStateStore>) -> Self {
        self.rollout_store = Some(store);
        self
    }

    /// Challenge responder shared with the issuer
    pub fn with_responder(mut self, responder: Arc<ChallengeResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn Issuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Wire every subsystem, register the configured hosts and reload
    /// persisted certificates.
    pub async fn build(self) -> Result<KeelControlPlane> {
        let config = self.config;
        let registry: Arc<dyn SpecRegistry> = match self.spec_registry {
            Some(registry) => registry,
            None => Arc::new(InMemorySpecRegistry::new()),
        };
        let replicas: Arc<dyn ReplicaStore> = match self.replica_store {
            Some(store) => store,
            None => Arc::new(InMemoryReplicaStore::new()),
        };
        let hosts: Arc<dyn HostInventory> = match self.host_inventory {
            Some(inventory) => inventory,
            None => Arc::new(InMemoryHostInventory::new()),
        };
        let rollout_store: Arc<dyn RolloutStateStore> = match self.rollout_store {
            Some(store) => store,
            None => Arc::new(InMemoryRolloutStateStore::new()),
        };
        let responder = self
            .responder
            .unwrap_or_else(|| Arc::new(ChallengeResponder::new()));
        let issuer: Arc<dyn Issuer> = match self.issuer {
            Some(issuer) => issuer,
            None => Arc::new(LocalAuthority::new(LOCAL_CA_NAME, Arc::clone(&responder))?),
        };

        for host in self.hosts {
            hosts.upsert(host).await?;
        }

        let configs = Arc::new(ConfigStore::new());
        let placement = Arc::new(PlacementEngine::new(
            replicas,
            Arc::clone(&hosts),
            self.runtime,
            Arc::clone(&configs),
        ));
        let health = Arc::new(HealthSupervisor::new(
            config.health.clone(),
            Arc::clone(&placement),
        ));
        let rollout = Arc::new(RolloutController::new(
            Arc::clone(&placement),
            Arc::clone(&health),
            rollout_store,
        ));

        let store = Arc::new(CertStore::new());
        let certs = Arc::new(CertificateManager::new(
            config.certs.clone(),
            Arc::clone(&store),
            Arc::clone(&responder),
            issuer,
        ));
        let reloaded = certs.load_from_dir().await?;

        let edge = Arc::new(EdgeRouter::new(placement.subscribe(), store, responder));
        let supervisor = Arc::new(RestartSupervisor::new(
            Arc::clone(&placement),
            Arc::clone(&health),
            Arc::clone(&rollout),
            Arc::clone(&registry),
        ));

        info!(certificates = reloaded, "Control plane built");
        Ok(KeelControlPlane {
            events: EventAggregator::with_capacity(config.event_log_capacity),
            config,
            registry,
            hosts,
            configs,
            placement,
            health,
            rollout,
            certs,
            edge,
            supervisor,
        })
    }
}
