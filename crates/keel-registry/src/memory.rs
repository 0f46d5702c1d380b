//! In-memory implementations of registry traits
//!
//! These back a single daemon and the test suites. Persistent deployments
//! implement the same traits.

use crate::error::{RegistryError, Result};
use crate::host::HostInventory;
use crate::replica::ReplicaStore;
use crate::spec::{SpecRegistry, SubmitOutcome};
use async_trait::async_trait;
use dashmap::DashMap;
use keel_types::{Host, HostId, ReplicaId, ReplicaInstance, ReplicaState, ServiceSpec};

/// In-memory spec registry
pub struct InMemorySpecRegistry {
    versions: DashMap<String, Vec<ServiceSpec>>,
    // highest version ever assigned, kept across removal so versions never repeat
    high_water: DashMap<String, u64>,
}

impl InMemorySpecRegistry {
    pub fn new() -> Self {
        Self {
            versions: DashMap::new(),
            high_water: DashMap::new(),
        }
    }
}

impl Default for InMemorySpecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpecRegistry for InMemorySpecRegistry {
    async fn submit(&self, mut spec: ServiceSpec) -> Result<SubmitOutcome> {
        spec.validate()?;

        let mut history = self.versions.entry(spec.name.clone()).or_default();
        if let Some(latest) = history.last() {
            if latest.fingerprint() == spec.fingerprint() {
                return Ok(SubmitOutcome::Unchanged {
                    version: latest.version,
                });
            }
        }

        let mut high_water = self.high_water.entry(spec.name.clone()).or_insert(0);
        *high_water += 1;
        spec.version = *high_water;
        spec.submitted_at = chrono::Utc::now();

        let version = spec.version;
        history.push(spec);
        Ok(SubmitOutcome::Registered { version })
    }

    async fn get(&self, service: &str, version: u64) -> Result<Option<ServiceSpec>> {
        Ok(self
            .versions
            .get(service)
            .and_then(|h| h.iter().find(|s| s.version == version).cloned()))
    }

    async fn latest(&self, service: &str) -> Result<Option<ServiceSpec>> {
        Ok(self.versions.get(service).and_then(|h| h.last().cloned()))
    }

    async fn previous(&self, service: &str) -> Result<Option<ServiceSpec>> {
        Ok(self.versions.get(service).and_then(|h| {
            let len = h.len();
            if len >= 2 {
                h.get(len - 2).cloned()
            } else {
                None
            }
        }))
    }

    async fn history(&self, service: &str) -> Result<Vec<ServiceSpec>> {
        self.versions
            .get(service)
            .map(|h| h.clone())
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))
    }

    async fn list_latest(&self) -> Result<Vec<ServiceSpec>> {
        let mut specs: Vec<ServiceSpec> = self
            .versions
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }

    async fn remove(&self, service: &str) -> Result<()> {
        self.versions
            .remove(service)
            .map(|_| ())
            .ok_or_else(|| RegistryError::ServiceNotFound(service.to_string()))
    }
}

/// In-memory replica store
pub struct InMemoryReplicaStore {
    replicas: DashMap<ReplicaId, ReplicaInstance>,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self {
            replicas: DashMap::new(),
        }
    }
}

impl Default for InMemoryReplicaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn insert(&self, replica: ReplicaInstance) -> Result<()> {
        if self.replicas.contains_key(&replica.id) {
            return Err(RegistryError::ReplicaAlreadyExists(replica.id));
        }
        self.replicas.insert(replica.id.clone(), replica);
        Ok(())
    }

    async fn get(&self, id: &ReplicaId) -> Result<Option<ReplicaInstance>> {
        Ok(self.replicas.get(id).map(|r| r.clone()))
    }

    async fn list(&self) -> Result<Vec<ReplicaInstance>> {
        let mut all: Vec<ReplicaInstance> = self.replicas.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| (&a.service, a.ordinal, a.version).cmp(&(&b.service, b.ordinal, b.version)));
        Ok(all)
    }

    async fn list_for_service(&self, service: &str) -> Result<Vec<ReplicaInstance>> {
        let mut replicas: Vec<ReplicaInstance> = self
            .replicas
            .iter()
            .filter(|r| r.service == service)
            .map(|r| r.value().clone())
            .collect();
        replicas.sort_by_key(|r| (r.ordinal, r.version));
        Ok(replicas)
    }

    async fn set_state(&self, id: &ReplicaId, state: ReplicaState) -> Result<ReplicaInstance> {
        let mut replica = self
            .replicas
            .get_mut(id)
            .ok_or_else(|| RegistryError::ReplicaNotFound(id.clone()))?;

        if replica.state != state {
            if !replica.state.can_transition_to(state) {
                return Err(RegistryError::InvalidTransition {
                    id: id.clone(),
                    from: replica.state,
                    to: state,
                });
            }
            replica.state = state;
            replica.updated_at = chrono::Utc::now();
        }
        Ok(replica.clone())
    }

    async fn set_address(&self, id: &ReplicaId, address: String) -> Result<()> {
        let mut replica = self
            .replicas
            .get_mut(id)
            .ok_or_else(|| RegistryError::ReplicaNotFound(id.clone()))?;
        replica.address = Some(address);
        replica.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn record_restart(&self, id: &ReplicaId) -> Result<u32> {
        let mut replica = self
            .replicas
            .get_mut(id)
            .ok_or_else(|| RegistryError::ReplicaNotFound(id.clone()))?;
        replica.restarts += 1;
        replica.updated_at = chrono::Utc::now();
        Ok(replica.restarts)
    }

    async fn remove(&self, id: &ReplicaId) -> Result<Option<ReplicaInstance>> {
        Ok(self.replicas.remove(id).map(|(_, r)| r))
    }
}

/// In-memory host inventory
pub struct InMemoryHostInventory {
    hosts: DashMap<HostId, Host>,
}

impl InMemoryHostInventory {
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
        }
    }

    /// Seed the inventory from a static host list
    pub fn with_hosts(hosts: impl IntoIterator<Item = Host>) -> Self {
        let inventory = Self::new();
        for host in hosts {
            inventory.hosts.insert(host.id.clone(), host);
        }
        inventory
    }
}

impl Default for InMemoryHostInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostInventory for InMemoryHostInventory {
    async fn upsert(&self, host: Host) -> Result<()> {
        self.hosts.insert(host.id.clone(), host);
        Ok(())
    }

    async fn get(&self, id: &HostId) -> Result<Option<Host>> {
        Ok(self.hosts.get(id).map(|h| h.clone()))
    }

    async fn list(&self) -> Result<Vec<Host>> {
        let mut hosts: Vec<Host> = self.hosts.iter().map(|h| h.value().clone()).collect();
        hosts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hosts)
    }

    async fn set_schedulable(&self, id: &HostId, schedulable: bool) -> Result<()> {
        let mut host = self
            .hosts
            .get_mut(id)
            .ok_or_else(|| RegistryError::HostNotFound(id.clone()))?;
        host.schedulable = schedulable;
        Ok(())
    }

    async fn remove(&self, id: &HostId) -> Result<()> {
        self.hosts
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::HostNotFound(id.clone()))
    }
}
