//! Retry Hold-Off
//!
//! Delay applied before each push attempt. It starts at zero, grows by a
//! quarter plus a fixed step after every attempt, is capped, and drops back
//! to zero after a success.

use std::time::Duration;

/// Hold-off configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Fixed growth added after each attempt.
    pub step: Duration,
    /// Upper bound on a single delay.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(1),
            max: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HoldOff {
    config: BackoffConfig,
    hold: Duration,
}

impl HoldOff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            hold: Duration::ZERO,
        }
    }

    /// Delay to wait before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.hold.min(self.config.max);
        self.hold = delay + delay / 4 + self.config.step;
        delay
    }

    /// Forget earlier failures.
    pub fn reset(&mut self) {
        self.hold = Duration::ZERO;
    }
}
