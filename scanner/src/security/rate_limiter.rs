//! Sliding-window rate limiting keyed by source.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use parking_lot::Mutex;
use scan_common::{RateLimitConfig, MAX_RATE_WINDOW_SECS};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Admits at most `threshold` events per key within a trailing `window`.
///
/// The purge, the count check and the append for a key all happen under one
/// lock, so concurrent callers can never jointly exceed the threshold.
pub struct RateLimiter {
    window: Duration,
    threshold: usize,
    windows: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    suppressed: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            // `ScanConfig::validate` rejects longer windows; clamp for direct callers.
            window: Duration::seconds(config.window_secs.min(MAX_RATE_WINDOW_SECS) as i64),
            threshold: config.threshold,
            windows: Mutex::new(HashMap::new()),
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn check_and_record(&self, source_key: &str, now: DateTime<Utc>) -> bool {
        let cutoff = self.cutoff(now);
        let mut windows = self.windows.lock();
        let timestamps = windows.entry(source_key.to_string()).or_default();
        // Events can be delivered out of order, so the front is not always the oldest.
        timestamps.retain(|ts| *ts > cutoff);

        if timestamps.len() < self.threshold {
            timestamps.push_back(now);
            true
        } else {
            let total = self.suppressed.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("Rate limit hit for {} ({} suppressed so far)", source_key, total);
            false
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Events denied since this limiter was created.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Drops keys whose windows hold no live timestamps. Returns how many were dropped.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = self.cutoff(now);
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, timestamps| {
            timestamps.retain(|ts| *ts > cutoff);
            !timestamps.is_empty()
        });
        before - windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn limiter(threshold: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            threshold,
            window_secs,
            ..Default::default()
        })
    }

    #[test]
    fn test_threshold_within_window() {
        let limiter = limiter(3, 60);
        let t0 = Utc::now();

        assert!(limiter.check_and_record("192.168.1.5", t0));
        assert!(limiter.check_and_record("192.168.1.5", t0 + Duration::seconds(3)));
        assert!(limiter.check_and_record("192.168.1.5", t0 + Duration::seconds(6)));
        assert!(!limiter.check_and_record("192.168.1.5", t0 + Duration::seconds(10)));
        assert_eq!(limiter.suppressed_count(), 1);

        // Once the window has passed the oldest entries, the key is admitted again.
        assert!(limiter.check_and_record("192.168.1.5", t0 + Duration::seconds(61)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1, 60);
        let now = Utc::now();
        assert!(limiter.check_and_record("a", now));
        assert!(limiter.check_and_record("b", now));
        assert!(!limiter.check_and_record("a", now));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_denied_events_do_not_extend_window() {
        let limiter = limiter(2, 60);
        let t0 = Utc::now();
        assert!(limiter.check_and_record("k", t0));
        assert!(limiter.check_and_record("k", t0 + Duration::seconds(1)));
        for s in 2..50 {
            assert!(!limiter.check_and_record("k", t0 + Duration::seconds(s)));
        }
        assert!(limiter.check_and_record("k", t0 + Duration::seconds(60)));
    }

    #[test]
    fn test_oversized_window_is_clamped() {
        let limiter = limiter(1, u64::MAX);
        let now = Utc::now();
        assert!(limiter.check_and_record("k", now));
        assert!(!limiter.check_and_record("k", now + Duration::days(6)));
        assert!(limiter.check_and_record("k", now + Duration::days(8)));
    }

    #[test]
    fn test_purge_idle() {
        let limiter = limiter(5, 60);
        let t0 = Utc::now();
        limiter.check_and_record("old", t0);
        limiter.check_and_record("fresh", t0 + Duration::seconds(50));
        assert_eq!(limiter.purge_idle(t0 + Duration::seconds(70)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_concurrent_callers_respect_threshold() {
        let limiter = Arc::new(limiter(100, 60));
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || (0..50).filter(|_| limiter.check_and_record("burst", now)).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(limiter.suppressed_count(), 300);
    }
}
