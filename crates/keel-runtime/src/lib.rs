//! Keel Runtime - Container runtime interface
//!
//! Keel never runs processes itself. The placement engine starts and stops
//! replicas through a [`ContainerRuntime`], and the health supervisor runs
//! probes through [`ContainerRuntime::exec`].
//!
//! [`SimulatedRuntime`] is an in-memory runtime with scriptable start
//! failures and probe outcomes, used by tests and the daemon's dev mode.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod configs;
pub mod error;
pub mod runtime;
pub mod simulated;

pub use configs::ConfigStore;
pub use error::{Result, RuntimeError};
pub use runtime::{ConfigMount, ContainerRuntime, RuntimeHandle, StartRequest};
pub use simulated::{ProbeBehavior, SimulatedRuntime};
