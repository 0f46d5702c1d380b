//! Per-domain TLS certificates
//!
//! The certificate manager is the only writer. The edge router reads
//! certificates through store snapshots and never mutates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Domain-validation challenge used to obtain a certificate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    #[default]
    #[serde(rename = "http-01")]
    Http01,
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeType::Http01 => f.write_str("http-01"),
        }
    }
}

/// Certificate and private key for one domain
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    pub domain: String,
    /// PKCS#8 private key, PEM encoded
    pub key_pem: String,
    /// Leaf certificate followed by intermediates, PEM encoded
    pub chain_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub challenge: ChallengeType,
    pub issuer: String,
    /// Hex fingerprint of the leaf certificate
    pub fingerprint: String,
}

impl Certificate {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Time left before expiry, zero once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.not_after - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the certificate is expired or expires within `renew_before`
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, renew_before: Duration) -> bool {
        !self.is_valid_at(now) || self.remaining_at(now) <= renew_before
    }

    pub fn summary(&self) -> CertificateSummary {
        let now = Utc::now();
        CertificateSummary {
            domain: self.domain.clone(),
            issuer: self.issuer.clone(),
            not_before: self.not_before,
            not_after: self.not_after,
            challenge: self.challenge,
            fingerprint: self.fingerprint.clone(),
            valid: self.is_valid_at(now),
            days_remaining: (self.not_after - now).num_days(),
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("domain", &self.domain)
            .field("issuer", &self.issuer)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Operator-facing view of a certificate (no key material)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSummary {
    pub domain: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub challenge: ChallengeType,
    pub fingerprint: String,
    pub valid: bool,
    pub days_remaining: i64,
}
