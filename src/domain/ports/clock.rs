//! Clock Ports
//!
//! The event log timestamps with a free-running tick counter; the push
//! worker corrects a separate wall clock from the collector's replies.

/// Free-running 32-bit counter used for event timestamps.
///
/// The counter wraps; consumers only ever look at wrapping differences.
pub trait TickSource: Send + Sync {
    fn now(&self) -> u32;

    /// Calibration word logged with START_LOGGING so that a collector can
    /// convert ticks into real time.
    fn calibration(&self) -> u32 {
        0
    }
}

/// Battery-backed real-time clock, in whole seconds since the Unix epoch.
pub trait WallClock: Send + Sync {
    /// Current time, or `None` when the clock has never been set.
    fn now_secs(&self) -> Option<i64>;

    /// Step the clock. Returns false if the hardware refused the update.
    fn step_to(&self, secs: i64) -> bool;
}
