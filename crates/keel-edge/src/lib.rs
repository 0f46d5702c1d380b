//! # Keel Edge - TLS-terminating edge router
//!
//! Routes requests by host to the healthy replicas of the target service:
//!
//! - the [`RouteTable`] is rebuilt from route rules, the replica snapshot
//!   and the certificate store, and swapped in atomically;
//! - the [`SniResolver`] picks the certificate for each TLS handshake from
//!   the certificate store and refuses names without a valid one;
//! - plaintext requests for `force_https` routes get a permanent redirect;
//! - HTTP-01 challenge paths are answered before routing.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod error;
pub mod proxy;
pub mod resolver;
pub mod router;
pub mod server;
pub mod table;

pub use config::EdgeConfig;
pub use error::{EdgeError, Result};
pub use proxy::Forwarder;
pub use resolver::{server_config, SniResolver};
pub use router::EdgeRouter;
pub use server::{edge_app, EdgeServer};
pub use table::{RouteDecision, RouteRequest, RouteSummary, RouteTable};
