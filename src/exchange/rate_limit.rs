//! Rate-limit tracking
//!
//! Every response updates the tracker from the `X-MBX-USED-WEIGHT-1m`,
//! `X-MBX-ORDER-COUNT-1m` and `Retry-After` headers. Three thresholds
//! govern behaviour: `warn` logs, `slow` starts spacing requests, `stop`
//! refuses outgoing requests until the minute window rolls.

use chrono::{DateTime, Utc};

/// Weight thresholds over the exchange's 2400/min request-weight budget.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitThresholds {
    pub warn: u32,
    pub slow: u32,
    pub stop: u32,
}

impl Default for RateLimitThresholds {
    fn default() -> Self {
        Self {
            warn: 1800,
            slow: 2100,
            stop: 2300,
        }
    }
}

/// Per-client tracker, mutated only inside the request path.
#[derive(Debug, Clone)]
pub struct RateLimitTracker {
    thresholds: RateLimitThresholds,
    used_weight_1m: u32,
    order_count_1m: u32,
    retry_after_secs: u64,
    last_updated: DateTime<Utc>,
}

impl RateLimitTracker {
    pub fn new(thresholds: RateLimitThresholds) -> Self {
        Self {
            thresholds,
            used_weight_1m: 0,
            order_count_1m: 0,
            retry_after_secs: 0,
            last_updated: Utc::now(),
        }
    }

    /// Ingest the rate-limit headers of one response. Header names are
    /// matched case-insensitively.
    pub fn update_from_headers<'a>(
        &mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        for (name, value) in headers {
            match name.to_ascii_lowercase().as_str() {
                "x-mbx-used-weight-1m" => {
                    if let Ok(weight) = value.parse() {
                        self.used_weight_1m = weight;
                    }
                }
                "x-mbx-order-count-1m" => {
                    if let Ok(count) = value.parse() {
                        self.order_count_1m = count;
                    }
                }
                "retry-after" => {
                    if let Ok(secs) = value.parse() {
                        self.retry_after_secs = secs;
                    }
                }
                _ => {}
            }
        }
        self.last_updated = Utc::now();
    }

    pub fn used_weight_1m(&self) -> u32 {
        self.used_weight_1m
    }

    pub fn order_count_1m(&self) -> u32 {
        self.order_count_1m
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_secs
    }

    pub fn should_warn(&self) -> bool {
        self.used_weight_1m >= self.thresholds.warn
    }

    pub fn should_slow_down(&self) -> bool {
        self.used_weight_1m >= self.thresholds.slow
    }

    pub fn should_stop(&self) -> bool {
        self.used_weight_1m >= self.thresholds.stop
    }

    /// Weight left before the stop threshold trips.
    pub fn remaining_weight(&self) -> u32 {
        self.thresholds.stop.saturating_sub(self.used_weight_1m)
    }

    /// The window rolls every minute on the exchange side; counters older
    /// than a minute no longer bind us.
    pub fn is_stale(&self) -> bool {
        (Utc::now() - self.last_updated).num_seconds() >= 60
    }

    pub fn reset(&mut self) {
        self.used_weight_1m = 0;
        self.order_count_1m = 0;
        self.retry_after_secs = 0;
        self.last_updated = Utc::now();
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(RateLimitThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_from_headers_case_insensitive() {
        let mut tracker = RateLimitTracker::default();
        tracker.update_from_headers([
            ("X-MBX-USED-WEIGHT-1M", "1234"),
            ("x-mbx-order-count-1m", "5"),
            ("Retry-After", "30"),
        ]);

        assert_eq!(tracker.used_weight_1m(), 1234);
        assert_eq!(tracker.order_count_1m(), 5);
        assert_eq!(tracker.retry_after_secs(), 30);
    }

    #[test]
    fn test_thresholds() {
        let mut tracker = RateLimitTracker::new(RateLimitThresholds {
            warn: 100,
            slow: 200,
            stop: 300,
        });

        tracker.update_from_headers([("x-mbx-used-weight-1m", "150")]);
        assert!(tracker.should_warn());
        assert!(!tracker.should_slow_down());
        assert!(!tracker.should_stop());

        tracker.update_from_headers([("x-mbx-used-weight-1m", "305")]);
        assert!(tracker.should_stop());
        assert_eq!(tracker.remaining_weight(), 0);

        tracker.reset();
        assert!(!tracker.should_warn());
    }

    #[test]
    fn test_unknown_headers_ignored() {
        let mut tracker = RateLimitTracker::default();
        tracker.update_from_headers([("content-type", "application/json")]);
        assert_eq!(tracker.used_weight_1m(), 0);
    }
}
