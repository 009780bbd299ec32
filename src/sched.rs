//! Periodic housekeeping
//!
//! Named intervals ("sample the battery every 40s") instead of counting
//! loop iterations.

use embassy_time::{Duration, Instant};

/// A recurring deadline
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    period: Duration,
    next: Instant,
}

impl Interval {
    /// First due one `period` after `now`
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    /// When this interval is next due
    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// Is the deadline reached?
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next
    }

    /// If due, re-arm relative to `now` and return `true`
    ///
    /// Re-arming from `now` rather than from the old deadline means a late
    /// poll doesn't cause a burst of catch-up firings.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.next = now + self.period;
            true
        } else {
            false
        }
    }

    /// Push the deadline out to one period after `now`
    pub fn reset(&mut self, now: Instant) {
        self.next = now + self.period;
    }
}
