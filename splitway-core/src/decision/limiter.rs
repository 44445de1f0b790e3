//! Token bucket gating how often a route may migrate between backends.

use std::time::{Duration, Instant};

/// A token bucket with burst capacity one, refilled once per cooldown period.
///
/// The bucket starts full. Tracked as the instant the next token becomes available,
/// so no background refill is needed.
#[derive(Debug, Clone)]
pub struct ChangeLimiter {
    period: Duration,
    next_token: Instant,
}

impl ChangeLimiter {
    /// A full bucket that refills one token per `period`.
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            next_token: now,
        }
    }

    /// Take the token if one is available at `now`.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        if now < self.next_token {
            return false;
        }
        self.next_token = now + self.period;
        true
    }

    /// Whether a token is available at `now`, without taking it.
    pub fn would_allow_at(&self, now: Instant) -> bool {
        now >= self.next_token
    }

    /// Change the refill period. An already scheduled token keeps its time.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// The refill period.
    pub fn period(&self) -> Duration {
        self.period
    }
}
