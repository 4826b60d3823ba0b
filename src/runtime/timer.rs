//! Periodic flush deadline for the event loop.
//!
//! mio has no timer source, so the loop passes [`FlushTimer::timeout`] to
//! `Poll::poll` and checks [`FlushTimer::fire_if_due`] after every wakeup.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct FlushTimer {
    period: Duration,
    next: Instant,
}

impl FlushTimer {
    /// Start a timer whose first tick is one `period` after `now`.
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next: now + period,
        }
    }

    /// Time left until the next tick, zero if it is already due.
    pub fn timeout(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Returns true once per elapsed deadline.
    ///
    /// If the loop fell behind by several periods the missed ticks are
    /// skipped rather than replayed back to back.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }

        let behind = now.duration_since(self.next).as_nanos();
        let missed = behind / self.period.as_nanos().max(1);
        let steps = u32::try_from(missed + 1).unwrap_or(u32::MAX);
        self.next += self.period.saturating_mul(steps);
        true
    }
}
