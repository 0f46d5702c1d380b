//! Configuration for keel-daemon
//!
//! Layered as built-in defaults, then an optional file, then `KEEL_`
//! environment variables (`KEEL_SERVER__LISTEN_ADDR=0.0.0.0:7070`).

use keel_certs::CertConfig;
use keel_control::ControlPlaneConfig;
use keel_edge::EdgeConfig;
use keel_health::HealthConfig;
use keel_types::units::parse_memory;
use keel_types::Host;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Management API server
    #[serde(default)]
    pub server: ServerConfig,

    /// Edge listeners and proxying
    #[serde(default)]
    pub edge: EdgeConfig,

    /// Certificate issuance and renewal
    #[serde(default)]
    pub certs: CertConfig,

    /// Health poll loop
    #[serde(default)]
    pub health: HealthConfig,

    /// Background supervision
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Hosts registered at startup
    #[serde(default)]
    pub inventory: InventoryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 7070)),
            enable_cors: true,
            max_body_size: default_max_body_size(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Restart supervision interval in milliseconds
    #[serde(default = "default_supervise_interval")]
    pub supervise_interval_ms: u64,

    /// Events retained for `GET /events`
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,

    /// Request certificates as soon as a TLS route appears
    #[serde(default = "default_true")]
    pub auto_certificates: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            supervise_interval_ms: default_supervise_interval(),
            event_log_capacity: default_event_log_capacity(),
            auto_certificates: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Fleet inventory loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// One inventory host as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub hostname: String,

    /// Memory capacity, e.g. `16g`
    pub memory: String,

    #[serde(default)]
    pub role: Option<String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Hard ulimit ceilings, -1 for unlimited
    #[serde(default)]
    pub ulimits: BTreeMap<String, i64>,

    #[serde(default)]
    pub address: Option<String>,
}

impl HostEntry {
    pub fn to_host(&self) -> Result<Host, String> {
        let memory = parse_memory(&self.memory)
            .map_err(|e| format!("host {}: {}", self.hostname, e))?;
        let mut host = Host::new(&self.hostname, memory);
        if let Some(role) = &self.role {
            host = host.with_role(role);
        }
        if let Some(address) = &self.address {
            host = host.with_address(address);
        }
        host.labels = self.labels.clone();
        host.ulimits = self.ulimits.clone();
        Ok(host)
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024
}

fn default_supervise_interval() -> u64 {
    5_000
}

fn default_event_log_capacity() -> usize {
    keel_control::events::DEFAULT_EVENT_LOG_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        Self::load_over(Self::default(), path)
    }

    /// Like [`DaemonConfig::load`] with `base` in place of the defaults
    pub fn load_over(base: DaemonConfig, path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&base)?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("KEEL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Unprivileged ports and a small simulated fleet
    pub fn development() -> Self {
        let mut config = Self::default();
        config.edge.http_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 8080));
        config.edge.https_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 8443));
        config.inventory.hosts = (1..=3)
            .map(|i| HostEntry {
                hostname: format!("node{:02}", i),
                memory: "16g".to_string(),
                role: None,
                labels: BTreeMap::new(),
                ulimits: BTreeMap::new(),
                address: Some("127.0.0.1".to_string()),
            })
            .collect();
        config
    }

    /// Settings handed to the control plane
    pub fn control_plane(&self) -> ControlPlaneConfig {
        ControlPlaneConfig {
            health: self.health.clone(),
            certs: self.certs.clone(),
            supervise_interval: Duration::from_millis(self.scheduler.supervise_interval_ms),
            event_log_capacity: self.scheduler.event_log_capacity,
            auto_certificates: self.scheduler.auto_certificates,
        }
    }

    /// Inventory entries as hosts
    pub fn hosts(&self) -> Result<Vec<Host>, String> {
        self.inventory.hosts.iter().map(HostEntry::to_host).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.listen_addr.port(), 7070);
        assert_eq!(config.edge.http_addr.port(), 80);
        assert!(config.scheduler.auto_certificates);
        assert!(config.inventory.hosts.is_empty());
    }

    #[test]
    fn test_control_plane_settings() {
        let mut config = DaemonConfig::default();
        config.scheduler.supervise_interval_ms = 250;
        config.scheduler.auto_certificates = false;

        let control = config.control_plane();
        assert_eq!(control.supervise_interval, Duration::from_millis(250));
        assert!(!control.auto_certificates);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "0.0.0.0:9090"

[scheduler]
auto_certificates = false

[[inventory.hosts]]
hostname = "es01"
memory = "8g"
labels = {{ zone = "a" }}

[[inventory.hosts]]
hostname = "es02"
memory = "512m"
role = "manager"
"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9090);
        assert!(!config.scheduler.auto_certificates);

        let hosts = config.hosts().unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].memory_bytes, 8 << 30);
        assert_eq!(hosts[0].labels.get("zone").map(String::as_str), Some("a"));
        assert_eq!(hosts[1].role, "manager");
    }

    #[test]
    fn test_bad_memory_is_reported() {
        let mut config = DaemonConfig::default();
        config.inventory.hosts.push(HostEntry {
            hostname: "es01".into(),
            memory: "lots".into(),
            role: None,
            labels: BTreeMap::new(),
            ulimits: BTreeMap::new(),
            address: None,
        });
        let err = config.hosts().unwrap_err();
        assert!(err.contains("es01"));
    }

    #[test]
    fn test_development_inventory() {
        let config = DaemonConfig::development();
        assert_eq!(config.hosts().unwrap().len(), 3);
        assert_eq!(config.edge.https_addr.port(), 8443);
    }
}
