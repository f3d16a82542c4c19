use std::time::{Duration, Instant};

use crate::descriptor::RateLimit;

/// Snapshot of one plugin's rate budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RateBudget {
    pub plugin_id: String,
    pub tokens: f64,
    pub capacity: u32,
    /// Tokens regained per second.
    pub refill_rate: f64,
    pub last_refill: Instant,
}

/// Lazily refilled token bucket.
///
/// Tokens are tracked in integer units so refill math is exact: one token is
/// `per` nanoseconds worth of units and every elapsed nanosecond adds
/// `requests` units.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    requests: u128,
    unit_per_token: u128,
    units: u128,
    last_refill: Instant,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(limit: RateLimit, now: Instant) -> Self {
        let requests = u128::from(limit.requests.max(1));
        let unit_per_token = limit.per().as_nanos().max(1);
        Self {
            requests,
            unit_per_token,
            units: requests * unit_per_token,
            last_refill: now,
        }
    }

    fn capacity_units(&self) -> u128 {
        self.requests * self.unit_per_token
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        if elapsed == 0 {
            return;
        }
        self.units = self
            .units
            .saturating_add(elapsed.saturating_mul(self.requests))
            .min(self.capacity_units());
        self.last_refill = now;
    }

    /// Debits one token, or reports how long until one is available.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.units >= self.unit_per_token {
            self.units -= self.unit_per_token;
            return Ok(());
        }
        let deficit = self.unit_per_token - self.units;
        let nanos = deficit.div_ceil(self.requests);
        Err(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }

    /// Refunds one token, capped at capacity.
    pub fn give_back(&mut self) {
        self.units = (self.units + self.unit_per_token).min(self.capacity_units());
    }

    pub fn tokens(&self) -> f64 {
        self.units as f64 / self.unit_per_token as f64
    }

    pub fn budget(&self, plugin_id: &str) -> RateBudget {
        let per_secs = self.unit_per_token as f64 / 1_000_000_000.0;
        RateBudget {
            plugin_id: plugin_id.to_string(),
            tokens: self.tokens(),
            capacity: u32::try_from(self.requests).unwrap_or(u32::MAX),
            refill_rate: self.requests as f64 / per_secs,
            last_refill: self.last_refill,
        }
    }
}
