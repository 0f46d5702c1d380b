//! Health supervisor configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Supervisor timing knobs. Probe interval, timeout, retries and start period
/// come from each spec's health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How often the poll loop looks for replicas that are due.
    #[serde(with = "millis")]
    pub tick: Duration,

    /// Exit-status check cadence for replicas without a health check.
    #[serde(with = "millis")]
    pub exit_check_interval: Duration,

    /// Upper bound between re-checks while waiting for terminal health.
    #[serde(with = "millis")]
    pub wait_poll: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            exit_check_interval: Duration::from_secs(5),
            wait_poll: Duration::from_millis(500),
        }
    }
}

impl HealthConfig {
    /// Tight timings for tests and dev mode.
    pub fn fast() -> Self {
        Self {
            tick: Duration::from_millis(50),
            exit_check_interval: Duration::from_millis(100),
            wait_poll: Duration::from_millis(50),
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
