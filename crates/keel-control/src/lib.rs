//! # Keel Control Plane
//!
//! Unified facade over the Keel subsystems.
//!
//! ## Overview
//!
//! [`KeelControlPlane`] is the single entry point for operator actions. It
//! composes the registry, placement engine, health supervisor, rollout
//! controller, certificate manager and edge router:
//!
//! - a submitted spec is versioned by the registry, then rolled out;
//! - route rules are recomputed from the latest specs and pushed to the edge;
//! - TLS hosts without a valid certificate get one requested;
//! - events from every subsystem land in one stream and a bounded log.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keel_control::KeelControlPlaneBuilder;
//! use keel_runtime::SimulatedRuntime;
//! use keel_types::{Host, ServiceSpec};
//!
//! # async fn example() -> keel_control::Result<()> {
//! let control_plane = KeelControlPlaneBuilder::new(SimulatedRuntime::shared())
//!     .with_hosts([Host::new("es01", 8 << 30)])
//!     .build()
//!     .await?;
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! control_plane.start(shutdown_rx);
//!
//! let report = control_plane
//!     .submit_service(ServiceSpec::new("kibana", "registry.local/kibana:8.11"))
//!     .await?;
//! println!("submitted v{}", report.version);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod builder;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod events;
pub mod supervision;

// Re-exports
pub use builder::{KeelControlPlaneBuilder, LOCAL_CA_NAME};
pub use config::ControlPlaneConfig;
pub use control_plane::{
    ControlPlaneStatus, KeelControlPlane, ServiceView, StackReport, SubmitReport,
};
pub use error::{ControlPlaneError, Result};
pub use events::{event_subject, EventAggregator, EventQuery};
pub use supervision::{ReconcileReport, RestartSupervisor};
