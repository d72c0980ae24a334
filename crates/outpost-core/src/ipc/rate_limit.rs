use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Sliding-window limit on connection attempts per principal.
pub struct RateLimiter {
    max_attempts: usize,
    window: Duration,
    state: Mutex<RateState>,
}

struct RateState {
    attempts: HashMap<String, Vec<Instant>>,
    last_cleanup: Instant,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            state: Mutex::new(RateState {
                attempts: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Record an attempt for `principal`; false when the window is already full.
    pub fn allow(&self, principal: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let mut state = self.state.lock();

        if now.duration_since(state.last_cleanup) > CLEANUP_INTERVAL {
            state
                .attempts
                .retain(|_, times| times.iter().any(|t| now.duration_since(*t) < window));
            state.last_cleanup = now;
        }

        let times = state.attempts.entry(principal.to_string()).or_default();
        times.retain(|t| now.duration_since(*t) < window);
        if times.len() >= self.max_attempts {
            return false;
        }
        times.push(now);
        true
    }

    pub fn tracked_principals(&self) -> usize {
        self.state.lock().attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_denies_after_max_attempts() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.allow("1000"));
        }
        assert!(!limiter.allow("1000"));
        assert!(limiter.allow("1001"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.allow("1000"));
        assert!(!limiter.allow("1000"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.allow("1000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_principals_pruned() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        limiter.allow("a");
        limiter.allow("b");
        tokio::time::advance(CLEANUP_INTERVAL + Duration::from_secs(1)).await;
        limiter.allow("c");
        assert_eq!(limiter.tracked_principals(), 1);
    }
}
