//! Rate limiting implementation for the firewall engine.
//!
//! Counters are kept in process, one per `(application, model, rule, key)`.
//! Each counter holds two fixed-window buckets and blends them to
//! approximate a sliding window:
//!
//! `effective = current + previous * (1 - elapsed_fraction_of_current_window)`
//!
//! Windows roll over lazily when a key is touched. Keys idle for more than
//! two periods are swept on access, so memory stays proportional to the
//! number of active keys.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::utils::format_rate_limit_key;

/// Identity of one counter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub application_id: String,
    pub model: String,
    /// Distinguishes several limits configured for the same model
    pub rule: String,
    /// `ip:<addr>` or `apikey:<value>`
    pub subject: String,
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_rate_limit_key(
            "rate_limit",
            &[&self.application_id, &self.model, &self.rule, &self.subject],
        ))
    }
}

/// Longest window a limit may use
pub const MAX_PERIOD: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Limit to enforce for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u64,
    pub period: Duration,
}

/// Result of a rate limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Blended request count including this request when it was allowed
    pub effective_count: f64,
    /// End of the current fixed window
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    current: u64,
    previous: u64,
    last_seen: Instant,
    period: Duration,
}

impl WindowState {
    fn new(now: Instant, period: Duration) -> Self {
        Self {
            window_start: now,
            current: 0,
            previous: 0,
            last_seen: now,
            period,
        }
    }

    /// Roll the buckets forward to the window containing `now`
    fn advance(&mut self, now: Instant, period: Duration) {
        if period != self.period {
            // limit edited under a live key: start over with the new period
            *self = Self::new(now, period);
            return;
        }
        if now.saturating_duration_since(self.last_seen) >= period {
            // a full period without traffic: nothing remains in the window
            self.window_start = now;
            self.current = 0;
            self.previous = 0;
            return;
        }
        let elapsed = now.saturating_duration_since(self.window_start);
        let windows = (elapsed.as_nanos() / period.as_nanos().max(1)) as u32;
        match windows {
            0 => {}
            1 => {
                self.previous = self.current;
                self.current = 0;
                self.window_start += period;
            }
            n => {
                self.previous = 0;
                self.current = 0;
                self.window_start = self
                    .window_start
                    .checked_add(period.saturating_mul(n))
                    .unwrap_or(now);
            }
        }
    }

    fn effective_count(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        let fraction = (elapsed / self.period.as_secs_f64()).clamp(0.0, 1.0);
        self.current as f64 + self.previous as f64 * (1.0 - fraction)
    }

    fn window_end(&self) -> Instant {
        self.window_start.checked_add(self.period).unwrap_or(self.window_start)
    }
}

/// Approximated sliding-window limiter
pub struct SlidingWindowLimiter {
    windows: DashMap<RateLimitKey, WindowState>,
    last_sweep: Mutex<Instant>,
    sweep_interval: Duration,
}

impl SlidingWindowLimiter {
    /// Create a new rate limiter instance
    pub fn new(sweep_interval: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
            sweep_interval,
        }
    }

    /// Count a request against `key` and report whether it is allowed
    pub fn check(&self, key: &RateLimitKey, limit: RateLimit) -> RateLimitStatus {
        self.check_at(key, limit, Instant::now())
    }

    /// As [`check`](Self::check), at an explicit instant
    pub fn check_at(&self, key: &RateLimitKey, limit: RateLimit, now: Instant) -> RateLimitStatus {
        self.maybe_sweep(now);

        let period = limit.period.clamp(Duration::from_millis(1), MAX_PERIOD);
        let mut entry = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| WindowState::new(now, period));
        let state = entry.value_mut();

        state.advance(now, period);
        state.last_seen = now;

        let before = state.effective_count(now);
        let allowed = before + 1.0 <= limit.requests as f64;
        if allowed {
            state.current += 1;
        }
        let effective_count = state.effective_count(now);
        let remaining = (limit.requests as f64 - effective_count).floor().max(0.0) as u64;
        let until_reset = state.window_end().saturating_duration_since(now);

        RateLimitStatus {
            allowed,
            limit: limit.requests,
            remaining,
            effective_count,
            reset_at: Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// Current blended count for a key without counting a request
    pub fn peek_at(&self, key: &RateLimitKey, now: Instant) -> f64 {
        match self.windows.get_mut(key) {
            Some(mut entry) => {
                let period = entry.period;
                let state = entry.value_mut();
                state.advance(now, period);
                state.effective_count(now)
            }
            None => 0.0,
        }
    }

    /// Reset the rate limit for a given key
    pub fn reset(&self, key: &RateLimitKey) {
        self.windows.remove(key);
    }

    /// Drop keys unseen for more than two of their periods
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_duration_since(state.last_seen) <= state.period.saturating_mul(2));
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn maybe_sweep(&self, now: Instant) {
        // only one caller sweeps; the rest skip rather than wait
        let Ok(mut last) = self.last_sweep.try_lock() else { return };
        if now.saturating_duration_since(*last) < self.sweep_interval {
            return;
        }
        *last = now;
        drop(last);

        let evicted = self.evict_idle(now);
        if evicted > 0 {
            log::debug!("Evicted {} idle rate limit counters", evicted);
        }
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(subject: &str) -> RateLimitKey {
        RateLimitKey {
            application_id: "app".to_string(),
            model: "gpt-4-turbo".to_string(),
            rule: "0".to_string(),
            subject: subject.to_string(),
        }
    }

    fn per_minute(requests: u64) -> RateLimit {
        RateLimit {
            requests,
            period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_rate_limiter() {
        let limiter = SlidingWindowLimiter::default();
        let start = Instant::now();
        let ip = key("ip:1.2.3.4");

        for i in 0..10 {
            let status = limiter.check_at(&ip, per_minute(10), start + Duration::from_secs(i));
            assert!(status.allowed, "request {} should be allowed", i + 1);
            assert_eq!(status.remaining, 9 - i);
        }

        let eleventh = limiter.check_at(&ip, per_minute(10), start + Duration::from_secs(30));
        assert!(!eleventh.allowed);
        assert_eq!(eleventh.remaining, 0);

        // Reset should allow new requests
        limiter.reset(&ip);
        assert!(limiter.check_at(&ip, per_minute(10), start + Duration::from_secs(31)).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::default();
        let now = Instant::now();
        assert!(limiter.check_at(&key("ip:1.1.1.1"), per_minute(1), now).allowed);
        assert!(!limiter.check_at(&key("ip:1.1.1.1"), per_minute(1), now).allowed);
        assert!(limiter.check_at(&key("ip:2.2.2.2"), per_minute(1), now).allowed);
    }

    #[test]
    fn test_effective_count_non_decreasing_within_window() {
        let limiter = SlidingWindowLimiter::default();
        let start = Instant::now();
        let k = key("apikey:abc");
        let mut last = 0.0;
        for i in 0..20 {
            let status = limiter.check_at(&k, per_minute(100), start + Duration::from_secs(i * 2));
            assert!(status.effective_count >= last);
            last = status.effective_count;
        }
    }

    #[test]
    fn test_oversized_period_is_clamped() {
        let limiter = SlidingWindowLimiter::new(Duration::ZERO);
        let start = Instant::now();
        let k = key("ip:7.7.7.7");
        let huge = RateLimit {
            requests: 2,
            period: Duration::from_secs(u64::MAX),
        };
        assert!(limiter.check_at(&k, huge, start).allowed);
        assert!(limiter.check_at(&k, huge, start + Duration::from_secs(1)).allowed);
        assert!(!limiter.check_at(&k, huge, start + Duration::from_secs(2)).allowed);
        assert_eq!(limiter.evict_idle(start + Duration::from_secs(3)), 0);
    }

    #[test]
    fn test_saturated_traffic_across_rollover() {
        let limiter = SlidingWindowLimiter::default();
        let start = Instant::now();
        let k = key("ip:5.5.5.5");
        let limit = per_minute(10);

        // fill the first window, then keep pushing denied requests
        for i in 0..30 {
            let status = limiter.check_at(&k, limit, start + Duration::from_secs(i * 2));
            assert_eq!(status.allowed, i < 10);
        }

        // In the next window the carried-over bucket loses weight as the
        // window advances, so the blended count only grows at a fixed
        // instant; between instants it may fall by the decayed share.
        let mut allowed = 0;
        for step in 0..20u64 {
            let at = start + Duration::from_secs(60 + step * 3);
            let before = limiter.peek_at(&k, at);
            let status = limiter.check_at(&k, limit, at);
            assert!(status.effective_count <= 10.0 + 1e-9);
            assert!(status.effective_count >= before);
            if status.allowed {
                allowed += 1;
                assert!((status.effective_count - before - 1.0).abs() < 1e-9);
            } else {
                assert!((status.effective_count - before).abs() < 1e-9);
            }
            // a second attempt at the same instant never lowers the count
            let again = limiter.check_at(&k, limit, at);
            assert!(again.effective_count >= status.effective_count);
            if again.allowed {
                allowed += 1;
            }
        }
        assert!((8..=10).contains(&allowed), "allowed {allowed} in the second window");
    }

    #[test]
    fn test_previous_window_is_blended() {
        let limiter = SlidingWindowLimiter::default();
        let start = Instant::now();
        let k = key("ip:9.9.9.9");
        assert!(limiter.check_at(&k, per_minute(10), start).allowed);
        for _ in 0..9 {
            assert!(limiter.check_at(&k, per_minute(10), start + Duration::from_secs(50)).allowed);
        }

        // 15s into the next window: 10 * (1 - 0.25) = 7.5 carried over
        let at = start + Duration::from_secs(75);
        let status = limiter.check_at(&k, per_minute(10), at);
        assert!(status.allowed);
        assert!((status.effective_count - 8.5).abs() < 1e-9);

        assert!(limiter.check_at(&k, per_minute(10), at).allowed);
        assert!(!limiter.check_at(&k, per_minute(10), at).allowed);
    }

    #[test]
    fn test_resets_after_idle_period() {
        let limiter = SlidingWindowLimiter::default();
        let start = Instant::now();
        let k = key("ip:5.5.5.5");
        for _ in 0..10 {
            limiter.check_at(&k, per_minute(10), start);
        }
        assert!(!limiter.check_at(&k, per_minute(10), start).allowed);

        let later = start + Duration::from_secs(60);
        let status = limiter.check_at(&k, per_minute(10), later);
        assert!(status.allowed);
        assert!(status.effective_count <= 1.0);
    }

    #[test]
    fn test_idle_keys_are_evicted() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(1));
        let start = Instant::now();
        limiter.check_at(&key("ip:a"), per_minute(5), start);
        limiter.check_at(&key("ip:b"), per_minute(5), start + Duration::from_secs(100));
        assert_eq!(limiter.len(), 2);

        assert_eq!(limiter.evict_idle(start + Duration::from_secs(121)), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.peek_at(&key("ip:a"), start + Duration::from_secs(121)), 0.0);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(SlidingWindowLimiter::default());
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.check_at(&key("ip:shared"), per_minute(100), now).allowed)
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("ip:1.2.3.4").to_string(), "rate_limit:app:gpt-4-turbo:0:ip:1.2.3.4");
    }
}
