//! In-process sliding-window rate limiting.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Request-budget store keyed by client identity (optionally suffixed with an
/// endpoint tag). Deployments that need shared limits across instances can
/// swap in a different implementation behind this trait.
pub trait RateLimitStore: Send + Sync {
    /// Returns `true` if the key is over budget. A limited attempt is not
    /// recorded against the window.
    fn check_and_record(&self, key: &str, max_requests: usize, window: Duration) -> bool;
}

const DEFAULT_MAX_KEYS: usize = 10_000;

/// Keys idle longer than this are eligible for eviction once the map is over
/// its key cap.
const SWEEP_IDLE: Duration = Duration::from_secs(600);

/// Sliding-window counter over a concurrent map of per-key timestamps.
///
/// Timestamps older than the window are pruned lazily on each check. State is
/// process-local and volatile: it resets on restart and is not shared between
/// instances.
pub struct SlidingWindowLimiter {
    windows: DashMap<String, Vec<Instant>>,
    max_keys: usize,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::with_max_keys(DEFAULT_MAX_KEYS)
    }

    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_keys,
        }
    }

    fn check_and_record_at(
        &self,
        key: &str,
        max_requests: usize,
        window: Duration,
        now: Instant,
    ) -> bool {
        if self.windows.len() > self.max_keys {
            self.sweep(now);
        }

        let mut stamps = self.windows.entry(key.to_owned()).or_default();

        // None means the window reaches past process start; nothing to prune.
        if let Some(window_start) = now.checked_sub(window) {
            stamps.retain(|&t| t > window_start);
        }

        let limited = stamps.len() >= max_requests;
        if !limited {
            stamps.push(now);
        }

        if stamps.is_empty() {
            drop(stamps);
            self.windows.remove(key);
        }
        limited
    }

    /// Drop keys whose newest timestamp is older than the idle horizon.
    fn sweep(&self, now: Instant) {
        let before = self.windows.len();
        self.windows
            .retain(|_, stamps| match stamps.last() {
                Some(&t) => now.saturating_duration_since(t) < SWEEP_IDLE,
                None => false,
            });
        debug!(
            evicted = before - self.windows.len(),
            remaining = self.windows.len(),
            "rate limit map sweep"
        );
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore for SlidingWindowLimiter {
    fn check_and_record(&self, key: &str, max_requests: usize, window: Duration) -> bool {
        self.check_and_record_at(key, max_requests, window, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn allows_up_to_max_requests() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();
        for _ in 0..3 {
            assert!(!limiter.check_and_record_at("1.2.3.4", 3, WINDOW, now));
        }
        assert!(limiter.check_and_record_at("1.2.3.4", 3, WINDOW, now));
    }

    #[test]
    fn window_slides_past_old_requests() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        for _ in 0..3 {
            assert!(!limiter.check_and_record_at("1.2.3.4", 3, WINDOW, start));
        }
        assert!(limiter.check_and_record_at("1.2.3.4", 3, WINDOW, start + Duration::from_secs(1)));
        // Once the first three age out, the budget frees up again.
        assert!(!limiter.check_and_record_at(
            "1.2.3.4",
            3,
            WINDOW,
            start + Duration::from_secs(61)
        ));
    }

    #[test]
    fn limited_attempts_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        assert!(!limiter.check_and_record_at("k", 1, WINDOW, start));
        assert!(limiter.check_and_record_at("k", 1, WINDOW, start + Duration::from_secs(30)));
        // The rejected attempt at +30s left no trace, so +70s is clear.
        assert!(!limiter.check_and_record_at("k", 1, WINDOW, start + Duration::from_secs(70)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();
        assert!(!limiter.check_and_record_at("a", 1, WINDOW, now));
        assert!(limiter.check_and_record_at("a", 1, WINDOW, now));
        assert!(!limiter.check_and_record_at("b", 1, WINDOW, now));
        assert!(!limiter.check_and_record_at("a:password_change", 1, WINDOW, now));
    }

    #[test]
    fn sweep_evicts_idle_keys_past_cap() {
        let limiter = SlidingWindowLimiter::with_max_keys(2);
        let start = Instant::now();
        limiter.check_and_record_at("a", 5, WINDOW, start);
        limiter.check_and_record_at("b", 5, WINDOW, start);
        limiter.check_and_record_at("c", 5, WINDOW, start);
        assert_eq!(limiter.key_count(), 3);
        // Next check past the idle horizon triggers a sweep of the stale keys.
        limiter.check_and_record_at("d", 5, WINDOW, start + Duration::from_secs(700));
        assert_eq!(limiter.key_count(), 1);
    }

    #[test]
    fn usable_as_trait_object() {
        let limiter: std::sync::Arc<dyn RateLimitStore> =
            std::sync::Arc::new(SlidingWindowLimiter::new());
        assert!(!limiter.check_and_record("k", 3, WINDOW));
    }
}
