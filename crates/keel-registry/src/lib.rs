//! Keel Registry - Spec history, replica store and host inventory
//!
//! This crate provides the state stores Keel components share:
//!
//! - **SpecRegistry**: versioned history of every submitted ServiceSpec
//! - **ReplicaStore**: replica instances (written only by the placement engine)
//! - **HostInventory**: fleet hosts the placement engine schedules onto
//!
//! ## In-Memory vs Persistent
//!
//! The crate provides in-memory implementations suitable for a single
//! daemon and for tests. Persistent backends implement the same traits.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod host;
pub mod memory;
pub mod replica;
pub mod spec;

// Re-exports
pub use error::{RegistryError, Result};
pub use host::HostInventory;
pub use memory::{InMemoryHostInventory, InMemoryReplicaStore, InMemorySpecRegistry};
pub use replica::ReplicaStore;
pub use spec::{SpecRegistry, SubmitOutcome};
