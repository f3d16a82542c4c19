use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use portal_core::{PortalError, RateBudget, RateLimit, TokenBucket};
use portal_logging::portal_debug;

/// Per-plugin token buckets. Refill happens lazily on every call; no timers.
///
/// Buckets are created full on first use with the limit passed in.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for a token, for at most `timeout`.
    pub async fn acquire(
        &self,
        plugin_id: &str,
        limit: RateLimit,
        timeout: Duration,
    ) -> Result<(), PortalError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            let now = Instant::now();
            let wait = match self.try_take(plugin_id, limit, now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            if now >= deadline {
                return Err(PortalError::RateLimitTimeout {
                    plugin_id: plugin_id.to_string(),
                    waited_ms: u64::try_from(now.duration_since(started).as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
            portal_debug!("rate limit for {}: next token in {:?}", plugin_id, wait);
            tokio::time::sleep(wait.min(deadline - now)).await;
        }
    }

    /// Returns one token to the plugin's bucket, capped at capacity.
    pub fn release(&self, plugin_id: &str) {
        if let Some(bucket) = self
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(plugin_id)
        {
            bucket.give_back();
        }
    }

    /// Current budget, or `None` when the plugin has not been throttled yet.
    pub fn budget(&self, plugin_id: &str) -> Option<RateBudget> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets.get_mut(plugin_id)?;
        bucket.refill(Instant::now().into_std());
        Some(bucket.budget(plugin_id))
    }

    fn try_take(&self, plugin_id: &str, limit: RateLimit, now: Instant) -> Result<(), Duration> {
        let now = now.into_std();
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(plugin_id.to_string())
            .or_insert_with(|| TokenBucket::new(limit, now))
            .try_take(now)
    }
}
