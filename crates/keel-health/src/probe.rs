//! Health probes executed through the container runtime

use keel_runtime::{ContainerRuntime, RuntimeError};
use keel_types::{HealthCheck, ReplicaId};
use std::fmt;
use std::time::Duration;

/// Result of one probe attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    /// Non-zero exit or exec error
    Failure(String),
    /// Attempt exceeded the check timeout; counts as a failure
    TimedOut(Duration),
    /// Main process is gone; no retries apply
    Exited(String),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Success => f.write_str("success"),
            ProbeOutcome::Failure(reason) => write!(f, "failed: {}", reason),
            ProbeOutcome::TimedOut(after) => write!(f, "timed out after {:?}", after),
            ProbeOutcome::Exited(reason) => write!(f, "exited: {}", reason),
        }
    }
}

/// Check the process, then run the health command if there is one.
///
/// The runtime is given the check timeout, and the call is bounded by it
/// again in case the runtime does not honor it.
pub async fn run_probe(
    runtime: &dyn ContainerRuntime,
    replica: &ReplicaId,
    check: Option<&HealthCheck>,
) -> ProbeOutcome {
    match runtime.exit_status(replica).await {
        Ok(Some(code)) => return ProbeOutcome::Exited(format!("process exited with code {}", code)),
        Ok(None) => {}
        Err(e) => return ProbeOutcome::Exited(e.to_string()),
    }

    let Some(check) = check else {
        return ProbeOutcome::Success;
    };

    match tokio::time::timeout(check.timeout, runtime.exec(replica, &check.command, check.timeout)).await {
        Ok(Ok(0)) => ProbeOutcome::Success,
        Ok(Ok(code)) => ProbeOutcome::Failure(format!("exit code {}", code)),
        Ok(Err(RuntimeError::Timeout { timeout, .. })) => ProbeOutcome::TimedOut(timeout),
        Ok(Err(e)) => ProbeOutcome::Failure(e.to_string()),
        Err(_) => ProbeOutcome::TimedOut(check.timeout),
    }
}
