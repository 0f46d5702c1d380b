//! # Keel Health - Replica health supervision
//!
//! Probes replicas through the container runtime and turns probe outcomes
//! into a per-replica [`HealthStatus`](keel_types::HealthStatus):
//!
//! - a replica is `starting` until it passes a probe;
//! - failures inside the start period do not count;
//! - `retries` consecutive failures make it `unhealthy`, which sticks until
//!   the replica is replaced or restarted and the tracker is [reset];
//! - a replica without a health check is healthy once running.
//!
//! Verdicts are recorded on the placement engine (the only writer of replica
//! state) and broadcast as [`HealthEvent`]s.
//!
//! [reset]: HealthSupervisor::reset

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod error;
pub mod probe;
pub mod supervisor;
pub mod tracker;

pub use config::HealthConfig;
pub use error::{HealthError, HealthResult};
pub use probe::ProbeOutcome;
pub use supervisor::{HealthEvent, HealthSupervisor};
pub use tracker::HealthTracker;
