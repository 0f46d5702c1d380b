//! Keel Placement - Constraint-driven replica placement
//!
//! Two layers:
//!
//! - [`reconcile`] is a pure function from (desired specs, hosts, current
//!   replicas) to a placement diff. It is deterministic and idempotent: an
//!   unchanged desired state yields an empty diff.
//! - [`PlacementEngine`] is the single writer of replica instances. It
//!   applies diff entries through the container runtime when asked to, and
//!   publishes replica snapshots that every other component observes.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod engine;
pub mod error;
pub mod plan;

pub use engine::{PlacementEngine, ReplicaSnapshot};
pub use error::{PlacementError, Result};
pub use plan::{pin_targets, plan_replacements, reconcile, Placement, PlacementPlan, Removal, RemovalReason};
