//! Tick Sources
//!
//! `CounterTickSource` derives the free-running event counter from the
//! monotonic clock. `ManualTickSource` is stepped by hand for tests and
//! simulations.

use crate::domain::ports::TickSource;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Calibration words are microseconds per tick in 20.12 fixed point.
const CALIBRATION_FRACTION_BITS: u32 = 12;

/// Counter ticking at a fixed period since process start.
pub struct CounterTickSource {
    origin: Instant,
    period_ns: u64,
    calibration: u32,
}

impl CounterTickSource {
    pub fn new(period: Duration) -> Self {
        let period_ns = (period.as_nanos() as u64).max(1);
        let calibration = ((period_ns << CALIBRATION_FRACTION_BITS) / 1000) as u32;
        Self {
            origin: Instant::now(),
            period_ns,
            calibration,
        }
    }

    /// Ticks spanning `duration`, saturating at the counter width.
    pub fn ticks_for(&self, duration: Duration) -> u32 {
        let ticks = duration.as_nanos() / self.period_ns as u128;
        ticks.min(u32::MAX as u128) as u32
    }
}

impl TickSource for CounterTickSource {
    fn now(&self) -> u32 {
        let elapsed = self.origin.elapsed().as_nanos() / self.period_ns as u128;
        // Wraps like the hardware counter.
        elapsed as u32
    }

    fn calibration(&self) -> u32 {
        self.calibration
    }
}

/// Tick source that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTickSource {
    now: AtomicU32,
    calibration: AtomicU32,
}

impl ManualTickSource {
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
            calibration: AtomicU32::new(0),
        }
    }

    pub fn advance(&self, ticks: u32) {
        // fetch_add wraps on overflow.
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }

    pub fn set(&self, ticks: u32) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    pub fn set_calibration(&self, calibration: u32) {
        self.calibration.store(calibration, Ordering::SeqCst);
    }
}

impl TickSource for ManualTickSource {
    fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }

    fn calibration(&self) -> u32 {
        self.calibration.load(Ordering::SeqCst)
    }
}
