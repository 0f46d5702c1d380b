//! Simulated container runtime
//!
//! Keeps replicas in memory. Start failures and probe outcomes are scripted
//! per service (optionally per version) or per replica.

use crate::error::{Result, RuntimeError};
use crate::runtime::{ConfigMount, ContainerRuntime, RuntimeHandle, StartRequest};
use async_trait::async_trait;
use dashmap::DashMap;
use keel_types::{HostId, ReplicaId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Scripted outcome of health probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeBehavior {
    /// Exit 0
    Pass,
    /// Exit 1
    Fail,
    /// Never return; the caller's timeout fires
    Hang,
    /// Fail the first `n` probes of each replica, then pass
    FailTimes(u32),
}

#[derive(Debug, Clone)]
struct SimReplica {
    service: String,
    version: u64,
    host: HostId,
    exit: Option<i32>,
    probes: u32,
    configs: Vec<ConfigMount>,
}

type ScriptKey = (String, Option<u64>);

/// In-memory runtime for tests and dev mode
#[derive(Default)]
pub struct SimulatedRuntime {
    replicas: DashMap<ReplicaId, SimReplica>,
    service_probes: DashMap<ScriptKey, ProbeBehavior>,
    replica_probes: DashMap<ReplicaId, ProbeBehavior>,
    start_failures: DashMap<ScriptKey, String>,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Script probes for every version of a service
    pub fn set_service_probe(&self, service: impl Into<String>, behavior: ProbeBehavior) {
        self.service_probes.insert((service.into(), None), behavior);
    }

    /// Script probes for one version of a service; takes precedence
    pub fn set_version_probe(&self, service: impl Into<String>, version: u64, behavior: ProbeBehavior) {
        self.service_probes
            .insert((service.into(), Some(version)), behavior);
    }

    /// Script probes for one replica; takes precedence over service scripts
    pub fn set_replica_probe(&self, replica: &ReplicaId, behavior: ProbeBehavior) {
        self.replica_probes.insert(replica.clone(), behavior);
    }

    /// Make starts of a service version (or every version) fail
    pub fn fail_starts(&self, service: impl Into<String>, version: Option<u64>, reason: impl Into<String>) {
        self.start_failures
            .insert((service.into(), version), reason.into());
    }

    pub fn clear_start_failures(&self) {
        self.start_failures.clear();
    }

    /// Simulate the replica's main process exiting
    pub fn kill(&self, replica: &ReplicaId, exit_code: i32) {
        if let Some(mut r) = self.replicas.get_mut(replica) {
            r.exit = Some(exit_code);
            info!(replica_id = %replica, exit_code, "Simulated replica killed");
        }
    }

    /// Replicas currently running, with their service, version and host
    pub fn running(&self) -> Vec<(ReplicaId, String, u64, HostId)> {
        self.replicas
            .iter()
            .filter(|r| r.exit.is_none())
            .map(|r| (r.key().clone(), r.service.clone(), r.version, r.host.clone()))
            .collect()
    }

    pub fn is_running(&self, replica: &ReplicaId) -> bool {
        self.replicas
            .get(replica)
            .is_some_and(|r| r.exit.is_none())
    }

    /// Content mounted into a replica at `target`
    pub fn mounted_config(&self, replica: &ReplicaId, target: &str) -> Option<Arc<[u8]>> {
        self.replicas.get(replica).and_then(|r| {
            r.configs
                .iter()
                .find(|m| m.target == target)
                .map(|m| Arc::clone(&m.content))
        })
    }

    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    fn scripted<T: Clone>(map: &DashMap<ScriptKey, T>, service: &str, version: u64) -> Option<T> {
        map.get(&(service.to_string(), Some(version)))
            .or_else(|| map.get(&(service.to_string(), None)))
            .map(|v| v.value().clone())
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn start(&self, request: StartRequest) -> Result<RuntimeHandle> {
        let spec = &request.spec;
        if let Some(reason) = Self::scripted(&self.start_failures, &spec.name, spec.version) {
            return Err(RuntimeError::StartFailed {
                replica: request.replica,
                host: request.host.hostname.clone(),
                reason,
            });
        }

        let address = request.host.reachable_address().to_string();
        self.replicas.insert(
            request.replica.clone(),
            SimReplica {
                service: spec.name.clone(),
                version: spec.version,
                host: request.host.id.clone(),
                exit: None,
                probes: 0,
                configs: request.configs,
            },
        );
        self.starts.fetch_add(1, Ordering::SeqCst);

        debug!(
            replica_id = %request.replica,
            service = %spec.name,
            version = spec.version,
            ordinal = request.ordinal,
            host = %request.host.id,
            "Simulated replica started"
        );

        Ok(RuntimeHandle {
            replica: request.replica,
            address,
        })
    }

    async fn stop(&self, replica: &ReplicaId) -> Result<()> {
        if self.replicas.remove(replica).is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
            debug!(replica_id = %replica, "Simulated replica stopped");
        }
        self.replica_probes.remove(replica);
        Ok(())
    }

    async fn exec(&self, replica: &ReplicaId, _command: &[String], timeout: Duration) -> Result<i32> {
        let (service, version, probes) = {
            let mut r = self
                .replicas
                .get_mut(replica)
                .ok_or_else(|| RuntimeError::NotRunning(replica.clone()))?;
            if r.exit.is_some() {
                return Err(RuntimeError::NotRunning(replica.clone()));
            }
            r.probes += 1;
            (r.service.clone(), r.version, r.probes)
        };

        let behavior = self
            .replica_probes
            .get(replica)
            .map(|b| *b.value())
            .or_else(|| Self::scripted(&self.service_probes, &service, version))
            .unwrap_or(ProbeBehavior::Pass);

        match behavior {
            ProbeBehavior::Pass => Ok(0),
            ProbeBehavior::Fail => Ok(1),
            ProbeBehavior::FailTimes(n) => Ok(if probes <= n { 1 } else { 0 }),
            ProbeBehavior::Hang => {
                let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
                Err(RuntimeError::Timeout {
                    replica: replica.clone(),
                    timeout,
                })
            }
        }
    }

    async fn exit_status(&self, replica: &ReplicaId) -> Result<Option<i32>> {
        self.replicas
            .get(replica)
            .map(|r| r.exit)
            .ok_or_else(|| RuntimeError::NotRunning(replica.clone()))
    }
}
