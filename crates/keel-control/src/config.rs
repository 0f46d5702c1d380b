//! Control plane configuration

use keel_certs::CertConfig;
use keel_health::HealthConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the subsystems the control plane owns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub health: HealthConfig,

    pub certs: CertConfig,

    /// Cadence of the restart supervision pass
    #[serde(with = "millis")]
    pub supervise_interval: Duration,

    /// Events retained for the operator API
    pub event_log_capacity: usize,

    /// Request certificates for TLS routes as soon as their rules appear
    pub auto_certificates: bool,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            certs: CertConfig::default(),
            supervise_interval: Duration::from_secs(5),
            event_log_capacity: crate::events::DEFAULT_EVENT_LOG_CAPACITY,
            auto_certificates: true,
        }
    }
}

impl ControlPlaneConfig {
    /// Tight timings for tests and dev mode
    pub fn fast() -> Self {
        Self {
            health: HealthConfig::fast(),
            certs: CertConfig {
                poll_interval: Duration::from_millis(50),
                challenge_timeout: Duration::from_secs(5),
                ..CertConfig::default()
            },
            supervise_interval: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
