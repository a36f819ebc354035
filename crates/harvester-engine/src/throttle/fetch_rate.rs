//! Leaky bucket on fetch starts: reservations spaced `60s / n` apart.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FetchSchedule {
    interval: Duration,
    next_slot: Option<Instant>,
}

impl FetchSchedule {
    #[must_use]
    pub fn new(fetches_per_minute: u32) -> Self {
        Self {
            interval: Self::interval_for(fetches_per_minute),
            next_slot: None,
        }
    }

    fn interval_for(fetches_per_minute: u32) -> Duration {
        Duration::from_secs(60) / fetches_per_minute.max(1)
    }

    pub fn set_rate(&mut self, fetches_per_minute: u32) {
        self.interval = Self::interval_for(fetches_per_minute);
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next start slot at or after `now`.
    pub fn reserve(&mut self, now: Instant) -> Instant {
        let start = match self.next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        self.next_slot = Some(start + self.interval);
        start
    }

    /// Give back a reservation that will not be used. Only the latest
    /// reservation can be returned; an earlier one leaves its gap.
    pub fn release(&mut self, start: Instant) {
        if self.next_slot == Some(start + self.interval) {
            self.next_slot = Some(start);
        }
    }

    /// Whether no reservation lies in the future.
    #[must_use]
    pub fn is_idle(&self, now: Instant) -> bool {
        self.next_slot.map_or(true, |slot| slot <= now)
    }
}
