//! Container runtime trait

use crate::error::Result;
use async_trait::async_trait;
use keel_types::{Host, ReplicaId, ServiceSpec};
use std::sync::Arc;
use std::time::Duration;

/// Config blob mounted read-only at a fixed path
#[derive(Debug, Clone)]
pub struct ConfigMount {
    pub name: String,
    pub target: String,
    pub content: Arc<[u8]>,
}

/// Everything the runtime needs to start one replica
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub replica: ReplicaId,
    pub spec: Arc<ServiceSpec>,
    pub host: Host,
    pub ordinal: u32,
    pub configs: Vec<ConfigMount>,
}

/// Handle returned by a successful start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub replica: ReplicaId,
    /// Address the replica's ports are reachable at
    pub address: String,
}

/// Interface to the container runtime on the fleet's hosts
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a replica on its assigned host
    async fn start(&self, request: StartRequest) -> Result<RuntimeHandle>;

    /// Stop a replica; stopping an unknown replica is not an error
    async fn stop(&self, replica: &ReplicaId) -> Result<()>;

    /// Run a command inside the replica and return its exit code.
    ///
    /// Exceeding `timeout` yields [`RuntimeError::Timeout`](crate::RuntimeError::Timeout).
    async fn exec(&self, replica: &ReplicaId, command: &[String], timeout: Duration)
        -> Result<i32>;

    /// Exit code if the replica's main process has exited
    async fn exit_status(&self, replica: &ReplicaId) -> Result<Option<i32>>;
}
