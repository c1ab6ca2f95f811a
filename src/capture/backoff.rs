//! Read-failure backoff

use std::time::Duration;

/// Consecutive failure counter that turns into a retry delay.
///
/// With no failures the delay is the base interval. After `n`
/// consecutive failures it is `base + step * n`, capped at `max` (or at
/// `base + step` when `max` is lower), so a failing device is never
/// polled faster than a healthy one.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    step: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, step: Duration, max: Duration) -> Self {
        Self {
            base,
            step,
            max,
            failures: 0,
        }
    }

    /// Count one more failure and return the delay before the next attempt
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.delay()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return self.base;
        }
        let cap = self.max.max(self.base.saturating_add(self.step));
        self.base
            .saturating_add(self.step.saturating_mul(self.failures))
            .min(cap)
    }
}
