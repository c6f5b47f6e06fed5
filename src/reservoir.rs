use std::time::Duration;
use tokio::time::Instant;

/// Refillable counter of the calls still permitted in the current window.
///
/// Refills are additive and periodic: every `refill_interval` the reservoir gains
/// `refill_amount` units, capped at `capacity`, whether or not anything was consumed.
#[derive(Debug, Clone)]
pub struct Reservoir {
    capacity: u64,
    remaining: u64,
    refill_amount: u64,
    refill_interval: Duration,
    last_refill_at: Instant,
}

impl Reservoir {
    /// Create a full reservoir whose refill schedule starts at `now`.
    pub fn new(capacity: u64, refill_amount: u64, refill_interval: Duration, now: Instant) -> Self {
        Self {
            capacity,
            remaining: capacity,
            refill_amount,
            refill_interval,
            last_refill_at: now,
        }
    }

    /// Take `units` if that many remain. Leaves the reservoir untouched otherwise.
    pub fn consume(&mut self, units: u64) -> bool {
        if self.remaining >= units {
            self.remaining -= units;
            true
        } else {
            false
        }
    }

    /// Apply every refill period that has fully elapsed by `now`.
    pub fn tick(&mut self, now: Instant) {
        if self.refill_interval.is_zero() {
            self.remaining = self.capacity;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill_at);
        let periods = elapsed.as_nanos() / self.refill_interval.as_nanos();
        if periods == 0 {
            return;
        }

        let added = (self.refill_amount as u128).saturating_mul(periods);
        self.remaining = (self.remaining as u128 + added).min(self.capacity as u128) as u64;

        // Stay phase-locked to the creation-time schedule rather than to `now`.
        let periods = u32::try_from(periods).unwrap_or(u32::MAX);
        self.last_refill_at += self.refill_interval.saturating_mul(periods);
    }

    /// When the next refill is due.
    pub fn next_refill_at(&self) -> Instant {
        self.last_refill_at + self.refill_interval
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}
