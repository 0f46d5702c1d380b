//! Certificate manager errors

use thiserror::Error;

/// Certificate errors
#[derive(Debug, Error)]
pub enum CertError {
    /// Domain validation did not succeed
    #[error("Challenge failed for {domain}: {reason}")]
    ChallengeFailed { domain: String, reason: String },

    /// Certificate authority rejected or could not serve the request
    #[error("Issuer error: {0}")]
    Issuer(String),

    #[error("Invalid certificate for {domain}: {reason}")]
    InvalidCertificate { domain: String, reason: String },

    /// HTTP-01 cannot validate this name
    #[error("Unsupported domain: {0}")]
    UnsupportedDomain(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for certificate operations
pub type Result<T> = std::result::Result<T, CertError>;
