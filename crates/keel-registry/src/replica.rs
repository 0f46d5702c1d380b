//! Replica store trait
//!
//! The ReplicaStore holds every ReplicaInstance. Only the placement engine
//! writes to it; everyone else reads snapshots.

use crate::error::Result;
use async_trait::async_trait;
use keel_types::{ReplicaId, ReplicaInstance, ReplicaState};

/// Store for replica instances
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Insert a new replica
    async fn insert(&self, replica: ReplicaInstance) -> Result<()>;

    /// Get a replica by ID
    async fn get(&self, id: &ReplicaId) -> Result<Option<ReplicaInstance>>;

    /// List all replicas
    async fn list(&self) -> Result<Vec<ReplicaInstance>>;

    /// List replicas of a service, ordered by ordinal
    async fn list_for_service(&self, service: &str) -> Result<Vec<ReplicaInstance>>;

    /// Move a replica to a new lifecycle state, enforcing legal transitions.
    ///
    /// Setting the current state again is a no-op.
    async fn set_state(&self, id: &ReplicaId, state: ReplicaState) -> Result<ReplicaInstance>;

    /// Record the endpoint address of a started replica
    async fn set_address(&self, id: &ReplicaId, address: String) -> Result<()>;

    /// Increment the restart counter, returning the new count
    async fn record_restart(&self, id: &ReplicaId) -> Result<u32>;

    /// Remove a replica
    async fn remove(&self, id: &ReplicaId) -> Result<Option<ReplicaInstance>>;
}
