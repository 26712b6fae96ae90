//! Probe result tracking.
//!
//! Folds consecutive probe outcomes into a desired registration state.
//! A failure takes effect immediately; recovery can be debounced with a
//! `rise` threshold.

use tracing::debug;

use regwatch_core::DesiredState;

/// Tracks consecutive probe results for a single service.
#[derive(Debug)]
pub struct StateTracker {
    /// Current desired state.
    desired: DesiredState,
    /// Consecutive failure count.
    consecutive_failures: u32,
    /// Consecutive success count (for recovery).
    consecutive_successes: u32,
    /// Successes needed before going UP.
    rise: u32,
}

impl StateTracker {
    /// Create a tracker. Services start DOWN until probed healthy.
    pub fn new(rise: u32) -> Self {
        Self {
            desired: DesiredState::Down,
            consecutive_failures: 0,
            consecutive_successes: 0,
            rise: rise.max(1),
        }
    }

    /// Record a probe result and return the new desired state.
    pub fn record(&mut self, success: bool) -> DesiredState {
        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);

            if self.consecutive_successes >= self.rise && self.desired != DesiredState::Up {
                debug!(successes = self.consecutive_successes, "service came up");
                self.desired = DesiredState::Up;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);

            if self.desired != DesiredState::Down {
                debug!(failures = self.consecutive_failures, "service went down");
            }
            self.desired = DesiredState::Down;
        }

        self.desired
    }

    pub fn desired(&self) -> DesiredState {
        self.desired
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Change the rise threshold. A service already UP stays UP.
    pub fn set_rise(&mut self, rise: u32) {
        self.rise = rise.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_down() {
        let tracker = StateTracker::new(1);
        assert_eq!(tracker.desired(), DesiredState::Down);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_goes_up_on_first_success() {
        let mut tracker = StateTracker::new(1);
        assert_eq!(tracker.record(true), DesiredState::Up);
    }

    #[test]
    fn single_failure_goes_down_immediately() {
        let mut tracker = StateTracker::new(1);
        tracker.record(true);
        tracker.record(true);

        assert_eq!(tracker.record(false), DesiredState::Down);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn rise_threshold_debounces_recovery() {
        let mut tracker = StateTracker::new(3);

        assert_eq!(tracker.record(true), DesiredState::Down);
        assert_eq!(tracker.record(true), DesiredState::Down);
        assert_eq!(tracker.record(true), DesiredState::Up);

        // A failure resets the streak.
        assert_eq!(tracker.record(false), DesiredState::Down);
        assert_eq!(tracker.record(true), DesiredState::Down);
        assert_eq!(tracker.consecutive_successes(), 1);
    }

    #[test]
    fn zero_rise_behaves_as_one() {
        let mut tracker = StateTracker::new(0);
        assert_eq!(tracker.record(true), DesiredState::Up);
    }

    #[test]
    fn lowering_rise_keeps_state() {
        let mut tracker = StateTracker::new(2);
        tracker.record(true);
        tracker.set_rise(1);
        assert_eq!(tracker.desired(), DesiredState::Down);
        assert_eq!(tracker.record(true), DesiredState::Up);
    }
}
