//! Keel Rollout - Moves a service's replicas from one spec version to the next
//!
//! One task per active rollout. A rollout replaces replicas in place, batch
//! by batch, and only admits the next batch once every member of the current
//! one is healthy. Failures escalate through the restart policy and then the
//! plan's failure action:
//!
//! ```text
//! Idle -> RollingOut -> Stable
//!              |    \-> Paused -> (resume | new submission | force_rollback)
//!              \-> RollingBack -> Stable (previous version)
//! ```
//!
//! For quorum-bearing services the quorum guard caps every batch so that the
//! number of simultaneously healthy replicas never drops below the quorum.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod batch;
pub mod controller;
pub mod error;
mod executor;
pub mod state;

pub use batch::{next_batch, pending_ordinals, validate_plan};
pub use controller::{RolloutController, SubmitDecision};
pub use error::{Result, RolloutError};
pub use state::{
    InMemoryRolloutStateStore, RolloutKind, RolloutOutcome, RolloutRecord, RolloutStateStore,
    StateStoreError,
};
