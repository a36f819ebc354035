//! Byte-rate token bucket with no stored burst.
//!
//! A fetch may start only while the bucket is not in deficit and no other
//! fetch of the bin is in flight. Its bytes are charged when it completes
//! and the deficit drains at the configured rate, so bytes admitted in any
//! window of length T stay within `rate * T` plus one fetch.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ByteBucket {
    bytes_per_sec: f64,
    deficit: f64,
    last_refill: Instant,
}

impl ByteBucket {
    #[must_use]
    pub fn new(kb_per_second: u64, now: Instant) -> Self {
        Self {
            bytes_per_sec: Self::rate(kb_per_second),
            deficit: 0.0,
            last_refill: now,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(kb_per_second: u64) -> f64 {
        (kb_per_second.max(1) * 1024) as f64
    }

    /// Change the rate; the current deficit is kept.
    pub fn set_rate(&mut self, kb_per_second: u64, now: Instant) {
        self.refill(now);
        self.bytes_per_sec = Self::rate(kb_per_second);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.deficit = (self.deficit - elapsed * self.bytes_per_sec).max(0.0);
        self.last_refill = self.last_refill.max(now);
    }

    /// Earliest instant a fetch may start.
    pub fn ready_at(&mut self, now: Instant) -> Instant {
        self.refill(now);
        if self.deficit <= 0.0 {
            return now;
        }
        now + Duration::from_secs_f64(self.deficit / self.bytes_per_sec)
    }

    /// Draw a completed fetch's bytes.
    #[allow(clippy::cast_precision_loss)]
    pub fn charge(&mut self, bytes: u64, now: Instant) {
        self.refill(now);
        self.deficit += bytes as f64;
    }

    #[must_use]
    pub fn in_deficit(&self) -> bool {
        self.deficit > 0.0
    }
}
