//! Rollout state persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_types::{RolloutId, RolloutStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// State store errors
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Forward rollout or revert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutKind {
    Rollout,
    Rollback,
}

/// How a rollout attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RolloutOutcome {
    InProgress,
    Completed,
    /// Completed with failed batches tolerated by `continue`
    CompletedWithFailures { failures: u32 },
    RolledBack { to_version: u64 },
    Paused { reason: String },
    Preempted { superseded_by: u64 },
}

/// One entry of a service's rollout history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub id: RolloutId,
    pub service: String,
    pub kind: RolloutKind,
    pub from_version: Option<u64>,
    pub to_version: u64,
    pub outcome: RolloutOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Storage for rollout statuses and history
#[async_trait]
pub trait RolloutStateStore: Send + Sync {
    /// Save the latest status of a service's rollout
    async fn save_status(&self, status: &RolloutStatus) -> Result<(), StateStoreError>;

    async fn status(&self, service: &str) -> Result<Option<RolloutStatus>, StateStoreError>;

    /// Latest status of every service, by service name
    async fn list_statuses(&self) -> Result<Vec<RolloutStatus>, StateStoreError>;

    /// Append a finished attempt to the service's history
    async fn record(&self, record: RolloutRecord) -> Result<(), StateStoreError>;

    /// History oldest first
    async fn history(&self, service: &str) -> Result<Vec<RolloutRecord>, StateStoreError>;

    /// Drop status and history
    async fn remove(&self, service: &str) -> Result<(), StateStoreError>;
}

/// In-memory rollout state store
pub struct InMemoryRolloutStateStore {
    statuses: DashMap<String, RolloutStatus>,
    history: DashMap<String, Vec<RolloutRecord>>,
    max_history: usize,
}

impl InMemoryRolloutStateStore {
    pub fn new() -> Self {
        Self::with_max_history(100)
    }

    /// Keep at most `max_history` records per service
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            history: DashMap::new(),
            max_history: max_history.max(1),
        }
    }
}

impl Default for InMemoryRolloutStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RolloutStateStore for InMemoryRolloutStateStore {
    async fn save_status(&self, status: &RolloutStatus) -> Result<(), StateStoreError> {
        self.statuses.insert(status.service.clone(), status.clone());
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<Option<RolloutStatus>, StateStoreError> {
        Ok(self.statuses.get(service).map(|s| s.clone()))
    }

    async fn list_statuses(&self) -> Result<Vec<RolloutStatus>, StateStoreError> {
        let mut statuses: Vec<RolloutStatus> = self.statuses.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(statuses)
    }

    async fn record(&self, record: RolloutRecord) -> Result<(), StateStoreError> {
        let mut history = self.history.entry(record.service.clone()).or_default();
        history.push(record);
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
        Ok(())
    }

    async fn history(&self, service: &str) -> Result<Vec<RolloutRecord>, StateStoreError> {
        Ok(self.history.get(service).map(|h| h.clone()).unwrap_or_default())
    }

    async fn remove(&self, service: &str) -> Result<(), StateStoreError> {
        self.statuses.remove(service);
        self.history.remove(service);
        Ok(())
    }
}
