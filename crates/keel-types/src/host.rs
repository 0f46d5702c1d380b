//! Fleet inventory hosts
//!
//! Hosts are read-only input to the placement engine. Their attributes are
//! what placement constraints are evaluated against.

use crate::HostId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A host in the fleet inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Stable host identifier
    pub id: HostId,

    /// Hostname matched by `node.hostname` constraints
    pub hostname: String,

    /// Host role matched by `node.role` constraints (e.g. `manager`, `worker`)
    #[serde(default = "default_role")]
    pub role: String,

    /// Free-form labels matched by `node.labels.<key>` constraints
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Memory available to replicas, in bytes
    pub memory_bytes: u64,

    /// Maximum hard ulimit the host can grant, per ulimit name (-1 = unlimited)
    #[serde(default)]
    pub ulimits: BTreeMap<String, i64>,

    /// Address replicas on this host are reachable at
    #[serde(default)]
    pub address: Option<String>,

    /// Whether new replicas may be placed here
    #[serde(default = "default_true")]
    pub schedulable: bool,
}

fn default_role() -> String {
    "worker".to_string()
}

fn default_true() -> bool {
    true
}

impl Host {
    /// Create a schedulable host with the given hostname and memory capacity
    pub fn new(hostname: impl Into<String>, memory_bytes: u64) -> Self {
        let hostname = hostname.into();
        Self {
            id: HostId::new(hostname.clone()),
            hostname,
            role: default_role(),
            labels: BTreeMap::new(),
            memory_bytes,
            ulimits: BTreeMap::new(),
            address: None,
            schedulable: true,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Resolve an attribute key the way constraints name them.
    ///
    /// `node.hostname`, `node.id` and `node.role` map to the typed fields;
    /// `node.labels.<k>` and `engine.labels.<k>` read labels; any other key is
    /// looked up directly in the labels.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "node.hostname" | "hostname" => Some(self.hostname.as_str()),
            "node.id" | "id" => Some(self.id.as_str()),
            "node.role" | "role" => Some(self.role.as_str()),
            _ => {
                let label = key
                    .strip_prefix("node.labels.")
                    .or_else(|| key.strip_prefix("engine.labels."))
                    .unwrap_or(key);
                self.labels.get(label).map(String::as_str)
            }
        }
    }

    /// Address replicas on this host are reachable at, falling back to the hostname
    pub fn reachable_address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.hostname)
    }
}
