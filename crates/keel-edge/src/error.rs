//! Edge router error types

use std::net::SocketAddr;
use thiserror::Error;

/// Edge router errors
#[derive(Debug, Error)]
pub enum EdgeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    /// Upstream request failed
    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Invalid route rule: {0}")]
    InvalidRule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for EdgeError {
    fn from(e: rustls::Error) -> Self {
        EdgeError::Tls(e.to_string())
    }
}

/// Result type for edge operations
pub type Result<T> = std::result::Result<T, EdgeError>;
