//! Exponential backoff between retries.

use std::time::Duration;

/// Doubling delay, capped at a maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            max,
            current: initial,
        }
    }

    /// Delay to wait now; the following one doubles, up to the max.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}
