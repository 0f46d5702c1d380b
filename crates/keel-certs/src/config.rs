//! Certificate manager configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Certificate manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    /// Renew once less than this remains before expiry
    #[serde(with = "millis")]
    pub renew_before: Duration,

    /// Upper bound on one domain validation
    #[serde(with = "millis")]
    pub challenge_timeout: Duration,

    /// Interval between order polls
    #[serde(with = "millis")]
    pub poll_interval: Duration,

    /// How often the renewal loop checks managed domains
    #[serde(with = "millis")]
    pub renewal_check_interval: Duration,

    /// Persist certificates as `<domain>.crt.pem` / `<domain>.key.pem`
    pub storage_dir: Option<PathBuf>,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            renew_before: Duration::from_secs(30 * 24 * 3600),
            challenge_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            renewal_check_interval: Duration::from_secs(12 * 3600),
            storage_dir: None,
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
