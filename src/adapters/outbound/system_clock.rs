//! System Wall Clock
//!
//! Implements WallClock on top of the host clock. Stepping records an
//! offset instead of touching the host time.

use crate::domain::ports::WallClock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
pub struct SystemWallClock {
    offset_secs: AtomicI64,
    valid: AtomicBool,
}

impl SystemWallClock {
    /// A clock trusting the host time.
    pub fn new() -> Self {
        Self {
            offset_secs: AtomicI64::new(0),
            valid: AtomicBool::new(true),
        }
    }

    /// A clock that reports no time until it is first stepped, like an RTC
    /// after its backup battery ran flat.
    pub fn unset() -> Self {
        Self {
            offset_secs: AtomicI64::new(0),
            valid: AtomicBool::new(false),
        }
    }

    fn host_secs() -> Option<i64> {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        i64::try_from(elapsed.as_secs()).ok()
    }
}

impl Default for SystemWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemWallClock {
    fn now_secs(&self) -> Option<i64> {
        if !self.valid.load(Ordering::SeqCst) {
            return None;
        }
        Some(Self::host_secs()? + self.offset_secs.load(Ordering::SeqCst))
    }

    fn step_to(&self, secs: i64) -> bool {
        let Some(host) = Self::host_secs() else {
            return false;
        };
        self.offset_secs.store(secs - host, Ordering::SeqCst);
        self.valid.store(true, Ordering::SeqCst);
        true
    }
}
