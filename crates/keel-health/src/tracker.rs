//! Per-replica health state machine
//!
//! Pure: time is passed in, nothing is probed here.

use crate::probe::ProbeOutcome;
use keel_types::{HealthCheck, HealthStatus};
use std::time::Duration;
use tokio::time::Instant;

/// Tracks probe outcomes for one replica
#[derive(Debug, Clone)]
pub struct HealthTracker {
    check: Option<HealthCheck>,
    interval: Duration,
    started_at: Instant,
    status: HealthStatus,
    consecutive_failures: u32,
    probes: u64,
    next_due: Instant,
}

impl HealthTracker {
    /// `fallback_interval` paces exit-status checks when there is no health check
    pub fn new(check: Option<HealthCheck>, fallback_interval: Duration, now: Instant) -> Self {
        let interval = check.as_ref().map_or(fallback_interval, |c| c.interval);
        Self {
            check,
            interval,
            started_at: now,
            status: HealthStatus::Starting,
            consecutive_failures: 0,
            probes: 0,
            next_due: now,
        }
    }

    pub fn check(&self) -> Option<&HealthCheck> {
        self.check.as_ref()
    }

    pub fn status(&self) -> &HealthStatus {
        &self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn probes(&self) -> u64 {
        self.probes
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Claim the next probe slot so concurrent observers do not double-probe
    pub fn claim(&mut self, now: Instant) {
        self.next_due = now + self.interval;
    }

    /// Whether failures are currently absorbed by the start period
    pub fn in_grace(&self, now: Instant) -> bool {
        matches!(self.status, HealthStatus::Starting)
            && self
                .check
                .as_ref()
                .is_some_and(|c| now.saturating_duration_since(self.started_at) < c.start_period)
    }

    /// Fold one outcome in. Returns the previous status when it changed.
    pub fn record(&mut self, outcome: &ProbeOutcome, now: Instant) -> Option<HealthStatus> {
        self.probes += 1;
        if self.is_due(now) {
            self.claim(now);
        }

        // unhealthy sticks until reset
        if matches!(self.status, HealthStatus::Unhealthy { .. }) {
            return None;
        }

        let next = match outcome {
            ProbeOutcome::Success => {
                self.consecutive_failures = 0;
                HealthStatus::Healthy
            }
            ProbeOutcome::Exited(reason) => HealthStatus::Unhealthy {
                reason: reason.clone(),
            },
            ProbeOutcome::Failure(_) | ProbeOutcome::TimedOut(_) => {
                if self.in_grace(now) {
                    return None;
                }
                self.consecutive_failures += 1;
                let retries = self.check.as_ref().map_or(1, |c| c.retries.max(1));
                if self.consecutive_failures >= retries {
                    HealthStatus::Unhealthy {
                        reason: format!(
                            "{} consecutive probe failures, last {}",
                            self.consecutive_failures, outcome
                        ),
                    }
                } else {
                    self.status.clone()
                }
            }
        };

        if next == self.status {
            None
        } else {
            Some(std::mem::replace(&mut self.status, next))
        }
    }

    /// Re-enter `starting` for a replaced or restarted replica
    pub fn reset(&mut self, now: Instant) {
        self.status = HealthStatus::Starting;
        self.consecutive_failures = 0;
        self.started_at = now;
        self.next_due = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(retries: u32, start_period: Duration) -> HealthCheck {
        HealthCheck::shell("true")
            .with_interval(Duration::from_secs(30))
            .with_retries(retries)
            .with_start_period(start_period)
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Failure("exit code 1".into())
    }

    #[test]
    fn test_retries_boundary() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(Some(check(3, Duration::ZERO)), Duration::from_secs(5), now);

        assert!(tracker.record(&fail(), now).is_none());
        assert!(tracker.record(&fail(), now).is_none());
        assert_eq!(tracker.status(), &HealthStatus::Starting);
        assert_eq!(tracker.consecutive_failures(), 2);

        let previous = tracker.record(&fail(), now);
        assert_eq!(previous, Some(HealthStatus::Starting));
        assert!(matches!(tracker.status(), HealthStatus::Unhealthy { .. }));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(Some(check(2, Duration::ZERO)), Duration::from_secs(5), now);

        tracker.record(&fail(), now);
        assert_eq!(tracker.record(&ProbeOutcome::Success, now), Some(HealthStatus::Starting));
        assert_eq!(tracker.status(), &HealthStatus::Healthy);

        tracker.record(&fail(), now);
        assert_eq!(tracker.status(), &HealthStatus::Healthy);
        tracker.record(&ProbeOutcome::TimedOut(Duration::from_secs(1)), now);
        assert!(matches!(tracker.status(), HealthStatus::Unhealthy { .. }));
    }

    #[test]
    fn test_start_period_absorbs_failures() {
        let start = Instant::now();
        let grace = Duration::from_secs(60);
        let mut tracker = HealthTracker::new(Some(check(1, grace)), Duration::from_secs(5), start);

        for _ in 0..5 {
            assert!(tracker.record(&fail(), start + Duration::from_secs(10)).is_none());
        }
        assert_eq!(tracker.consecutive_failures(), 0);

        // success inside grace promotes right away
        tracker.record(&ProbeOutcome::Success, start + Duration::from_secs(20));
        assert_eq!(tracker.status(), &HealthStatus::Healthy);

        // once healthy, grace no longer applies
        tracker.record(&fail(), start + Duration::from_secs(30));
        assert!(matches!(tracker.status(), HealthStatus::Unhealthy { .. }));
    }

    #[test]
    fn test_failure_after_grace_counts() {
        let start = Instant::now();
        let mut tracker =
            HealthTracker::new(Some(check(1, Duration::from_secs(60))), Duration::from_secs(5), start);
        tracker.record(&fail(), start + Duration::from_secs(61));
        assert!(matches!(tracker.status(), HealthStatus::Unhealthy { .. }));
    }

    #[test]
    fn test_unhealthy_sticks_until_reset() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(None, Duration::from_secs(5), now);

        tracker.record(&ProbeOutcome::Exited("process exited with code 137".into()), now);
        assert!(tracker.record(&ProbeOutcome::Success, now).is_none());
        assert!(matches!(tracker.status(), HealthStatus::Unhealthy { .. }));

        tracker.reset(now);
        assert_eq!(tracker.status(), &HealthStatus::Starting);
        assert!(tracker.is_due(now));
        tracker.record(&ProbeOutcome::Success, now);
        assert_eq!(tracker.status(), &HealthStatus::Healthy);
    }

    #[test]
    fn test_probe_scheduling() {
        let now = Instant::now();
        let mut tracker = HealthTracker::new(Some(check(3, Duration::ZERO)), Duration::from_secs(5), now);
        assert!(tracker.is_due(now));

        tracker.claim(now);
        assert!(!tracker.is_due(now + Duration::from_secs(29)));
        assert!(tracker.is_due(now + Duration::from_secs(30)));
    }
}
