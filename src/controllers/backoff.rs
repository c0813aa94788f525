//! Per-resource exponential error backoff
//!
//! Failure counts are tracked per `namespace/name` so one failing Database
//! never slows down retries of another.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

/// Consecutive-failure counters with `base * 2^n` delays, capped at `max`
#[derive(Debug)]
pub struct ErrorBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ErrorBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for the `failures`-th consecutive failure (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Record a failure for `key` and return the delay before the next attempt
    pub fn record_failure(&self, key: &str) -> (Duration, u32) {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                (self.delay_for(*count), *count)
            }
            Err(e) => {
                warn!("Failed to lock backoff state: {}, using base delay", e);
                (self.base, 0)
            }
        }
    }

    /// Forget failures for `key` after a successful attempt
    pub fn reset(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }

    /// Current failure count for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .ok()
            .and_then(|f| f.get(key).copied())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ErrorBackoff {
        ErrorBackoff::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    #[test]
    fn test_delays_double_until_capped() {
        let backoff = backoff();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(40));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_failures_are_tracked_per_resource() {
        let backoff = backoff();
        backoff.record_failure("shop/orders");
        let (delay, count) = backoff.record_failure("shop/orders");
        assert_eq!(count, 2);
        assert_eq!(delay, Duration::from_secs(10));

        let (delay, count) = backoff.record_failure("shop/carts");
        assert_eq!(count, 1);
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_success_resets() {
        let backoff = backoff();
        backoff.record_failure("shop/orders");
        backoff.reset("shop/orders");
        assert_eq!(backoff.failures("shop/orders"), 0);
        assert_eq!(backoff.record_failure("shop/orders").0, Duration::from_secs(5));
    }
}
