//! Rate Limiter Policy (C11): a sliding-window counter per key, shared
//! concurrently via `dashmap` the way the dedupe cache shares its map. Two
//! instances are configured by the app: the global API limiter and the
//! tighter webhook limiter.
//!
//! The window is a true sliding window, not a fixed bucket that resets to
//! zero at a boundary: each key tracks the current bucket's count plus the
//! immediately preceding bucket's count, and the preceding bucket's
//! contribution decays linearly as the current bucket fills, the standard
//! weighted sliding-window-counter approximation. A fixed-window reset would
//! let a client burst up to `2 * max_requests` across a bucket boundary;
//! weighting the previous bucket's count closes that gap without needing a
//! full per-request timestamp log.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl RateLimiterConfig {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    current_start: Instant,
    current_count: u32,
    previous_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { limit: u32, remaining: u32, reset_secs: u64 },
    Limited { limit: u32, retry_after_secs: u64, reset_secs: u64 },
}

impl RateLimitDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Checks and records one request for `key` at `now`. Callers pass
    /// `Instant::now()` in production and an explicit clock in tests.
    pub fn check(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            current_start: now,
            current_count: 0,
            previous_count: 0,
        });

        let window_nanos = self.config.window.as_nanos().max(1);
        let elapsed = now.saturating_duration_since(entry.current_start);
        if elapsed >= self.config.window {
            let periods = elapsed.as_nanos() / window_nanos;
            entry.previous_count = if periods == 1 { entry.current_count } else { 0 };
            entry.current_count = 0;
            let shift = self.config.window * (periods.min(u32::MAX as u128) as u32);
            entry.current_start += shift;
        }
        entry.current_count += 1;

        let elapsed_in_current = now.saturating_duration_since(entry.current_start);
        let weight = 1.0 - (elapsed_in_current.as_secs_f64() / self.config.window.as_secs_f64()).min(1.0);
        let estimated = entry.previous_count as f64 * weight + entry.current_count as f64;
        let reset_secs = self.config.window.saturating_sub(elapsed_in_current).as_secs().max(1);

        if estimated > self.config.max_requests as f64 {
            RateLimitDecision::Limited {
                limit: self.config.max_requests,
                retry_after_secs: reset_secs,
                reset_secs,
            }
        } else {
            let remaining = (self.config.max_requests as f64 - estimated).floor().max(0.0) as u32;
            RateLimitDecision::Allowed {
                limit: self.config.max_requests,
                remaining,
                reset_secs,
            }
        }
    }

    /// Drops all tracked windows. Exposed for test isolation, mirroring the
    /// dedupe cache's `reset()` hook.
    pub fn reset(&self) {
        self.windows.clear();
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Composite key for the webhook limiter: `(clientIp, tenantHint,
/// refreshHint)` per §4.4.
pub fn webhook_key(client_ip: &str, tenant_hint: Option<&str>, refresh_hint: Option<&str>) -> String {
    format!(
        "{client_ip}|{}|{}",
        tenant_hint.unwrap_or("unknown"),
        refresh_hint.unwrap_or("unknown")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_limit() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(10), 3));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check("ip-1", now).allowed());
        }
    }

    #[test]
    fn rejects_requests_over_the_limit_within_window() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(10), 2));
        let now = Instant::now();
        assert!(limiter.check("ip-1", now).allowed());
        assert!(limiter.check("ip-1", now).allowed());
        let decision = limiter.check("ip-1", now);
        match decision {
            RateLimitDecision::Limited { retry_after_secs, .. } => assert!(retry_after_secs >= 1),
            RateLimitDecision::Allowed { .. } => panic!("expected limited"),
        }
    }

    #[test]
    fn window_resets_once_the_previous_bucket_fully_decays() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(50), 1));
        let now = Instant::now();
        assert!(limiter.check("ip-1", now).allowed());
        assert!(!limiter.check("ip-1", now).allowed());
        // Two full windows later the prior bucket's weighted contribution is zero.
        let later = now + Duration::from_millis(110);
        assert!(limiter.check("ip-1", later).allowed());
    }

    #[test]
    fn burst_across_a_bucket_boundary_is_still_capped() {
        // A fixed window would allow `max_requests` again as soon as the clock
        // ticks past the boundary; the weighted window must not.
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(100), 4));
        let now = Instant::now();
        for _ in 0..4 {
            assert!(limiter.check("ip-1", now).allowed());
        }
        // Just past the boundary: the previous bucket's 4 requests still carry
        // most of their weight, so a handful more requests should be rejected.
        let just_after = now + Duration::from_millis(101);
        let mut allowed_in_new_bucket = 0;
        for _ in 0..4 {
            if limiter.check("ip-1", just_after).allowed() {
                allowed_in_new_bucket += 1;
            }
        }
        assert!(allowed_in_new_bucket < 4, "expected the weighted window to reject at least one burst request");
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(10), 1));
        let now = Instant::now();
        assert!(limiter.check("ip-1", now).allowed());
        assert!(limiter.check("ip-2", now).allowed());
    }

    #[test]
    fn webhook_key_joins_hints_with_fallback() {
        assert_eq!(webhook_key("1.2.3.4", Some("tenant-A"), None), "1.2.3.4|tenant-A|unknown");
        assert_eq!(webhook_key("1.2.3.4", None, None), "1.2.3.4|unknown|unknown");
    }

    #[test]
    fn reset_clears_tracked_windows() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(10), 1));
        limiter.check("ip-1", Instant::now());
        assert_eq!(limiter.len(), 1);
        limiter.reset();
        assert!(limiter.is_empty());
    }
}
