#![forbid(unsafe_code)]

//! Time source abstraction for the scheduler.
//!
//! In production the queue reads `web_time::Instant::now()`. In tests a
//! [`ManualClock`] is advanced explicitly, so recurring-task and
//! throttling behavior is fully deterministic without sleeping.
//!
//! # Invariants
//!
//! 1. `now()` is monotonically non-decreasing for both sources.
//! 2. All [`Clock`] handles cloned from the same manual source observe the
//!    same time.

use std::cell::Cell;
use std::rc::Rc;

use web_time::{Duration, Instant};

/// A manually-advanceable clock for deterministic tests.
///
/// All handles sharing the same `ManualClock` see the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset_us: Rc<Cell<u64>>,
}

impl ManualClock {
    /// Create a new manual clock starting at `Instant::now()`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Rc::new(Cell::new(0)),
        }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let us = delta.as_micros().min(u64::MAX as u128) as u64;
        self.offset_us.set(self.offset_us.get().saturating_add(us));
    }

    /// Current manual time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.epoch + Duration::from_micros(self.offset_us.get())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Time source used by the task queue.
#[derive(Debug, Clone)]
enum TimeSource {
    /// Real wall-clock time.
    Real,
    /// Deterministic manual clock for testing.
    Manual(ManualClock),
}

/// Cheaply cloneable clock handle.
#[derive(Debug, Clone)]
pub struct Clock {
    source: TimeSource,
}

impl Clock {
    /// Real wall-clock time source.
    #[must_use]
    pub fn real() -> Self {
        Self {
            source: TimeSource::Real,
        }
    }

    /// Manual time source driven by `clock`.
    #[must_use]
    pub fn manual(clock: ManualClock) -> Self {
        Self {
            source: TimeSource::Manual(clock),
        }
    }

    /// Current time according to this source.
    #[must_use]
    pub fn now(&self) -> Instant {
        match &self.source {
            TimeSource::Real => Instant::now(),
            TimeSource::Manual(m) => m.now(),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::real()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let manual = ManualClock::new();
        let clock = Clock::manual(manual.clone());
        let t0 = clock.now();
        manual.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - t0, Duration::from_millis(250));
    }

    #[test]
    fn cloned_handles_share_time() {
        let manual = ManualClock::new();
        let a = Clock::manual(manual.clone());
        let b = a.clone();
        manual.advance(Duration::from_secs(1));
        assert_eq!(a.now(), b.now());
    }

    #[test]
    fn real_clock_is_monotonic() {
        let clock = Clock::real();
        let t0 = clock.now();
        let t1 = clock.now();
        assert!(t1 >= t0);
    }
}
