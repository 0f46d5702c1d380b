//! Spec registry trait
//!
//! The SpecRegistry keeps every submitted version of every service. Versions
//! are assigned here and increase monotonically per service name.

use crate::error::Result;
use async_trait::async_trait;
use keel_types::ServiceSpec;
use serde::{Deserialize, Serialize};

/// Result of submitting a spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Stored as a new version
    Registered { version: u64 },
    /// Content identical to the latest version; nothing stored
    Unchanged { version: u64 },
}

impl SubmitOutcome {
    pub fn version(&self) -> u64 {
        match self {
            SubmitOutcome::Registered { version } | SubmitOutcome::Unchanged { version } => {
                *version
            }
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, SubmitOutcome::Registered { .. })
    }
}

/// Registry for versioned service specs
#[async_trait]
pub trait SpecRegistry: Send + Sync {
    /// Validate and store a spec, assigning the next version.
    ///
    /// A spec whose fingerprint matches the latest version is not stored.
    async fn submit(&self, spec: ServiceSpec) -> Result<SubmitOutcome>;

    /// Get a specific version
    async fn get(&self, service: &str, version: u64) -> Result<Option<ServiceSpec>>;

    /// Latest version of a service
    async fn latest(&self, service: &str) -> Result<Option<ServiceSpec>>;

    /// Version preceding the latest one
    async fn previous(&self, service: &str) -> Result<Option<ServiceSpec>>;

    /// All versions of a service, oldest first
    async fn history(&self, service: &str) -> Result<Vec<ServiceSpec>>;

    /// Latest version of every service, ordered by name
    async fn list_latest(&self) -> Result<Vec<ServiceSpec>>;

    /// Forget a service and its history
    async fn remove(&self, service: &str) -> Result<()>;
}
