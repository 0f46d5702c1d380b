//! Keel daemon library
//!
//! - REST API handlers under `/api/v1`
//! - Layered daemon configuration
//! - Server lifecycle: API, edge listeners and control plane loops

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use server::Server;
