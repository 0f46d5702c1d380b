//! Host inventory trait

use crate::error::Result;
use async_trait::async_trait;
use keel_types::{Host, HostId};

/// Fleet inventory. Read-only to the placement engine.
#[async_trait]
pub trait HostInventory: Send + Sync {
    /// Add or replace a host
    async fn upsert(&self, host: Host) -> Result<()>;

    /// Get a host by ID
    async fn get(&self, id: &HostId) -> Result<Option<Host>>;

    /// All hosts, ordered by ID
    async fn list(&self) -> Result<Vec<Host>>;

    /// Mark a host (un)schedulable
    async fn set_schedulable(&self, id: &HostId, schedulable: bool) -> Result<()>;

    /// Remove a host
    async fn remove(&self, id: &HostId) -> Result<()>;
}
