//! Per-sender sliding-window request limiter.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Admits at most `max_requests` per sender within any `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    seen: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// `None` when `max_requests` is 0 (limiting disabled).
    pub fn new(max_requests: u32, window: Duration) -> Option<Self> {
        (max_requests > 0).then(|| Self { max_requests, window, seen: HashMap::new() })
    }

    /// Record a request from `sender_id` at `now`; `false` if it is over the limit.
    /// Rejected requests do not count against the window.
    pub fn check(&mut self, sender_id: &str, now: Instant) -> bool {
        let window = self.window;
        let times = self.seen.entry(sender_id.to_string()).or_default();
        while times.front().is_some_and(|t| now.saturating_duration_since(*t) >= window) {
            times.pop_front();
        }
        if times.len() >= self.max_requests as usize {
            return false;
        }
        times.push_back(now);
        true
    }

    /// Forget senders with nothing left in their window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen.retain(|_, times| times.back().is_some_and(|t| now.saturating_duration_since(*t) < window));
    }

    pub fn tracked_senders(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disables() {
        assert!(RateLimiter::new(0, Duration::from_secs(60)).is_none());
    }

    #[test]
    fn window_slides() {
        let mut rl = RateLimiter::new(2, Duration::from_secs(60)).unwrap();
        let t0 = Instant::now();
        assert!(rl.check("a", t0));
        assert!(rl.check("a", t0 + Duration::from_secs(10)));
        assert!(!rl.check("a", t0 + Duration::from_secs(20)));
        // Other senders have their own budget.
        assert!(rl.check("b", t0 + Duration::from_secs(20)));
        // First request ages out.
        assert!(rl.check("a", t0 + Duration::from_secs(60)));
        assert!(!rl.check("a", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn prune_drops_idle_senders() {
        let mut rl = RateLimiter::new(5, Duration::from_secs(1)).unwrap();
        let t0 = Instant::now();
        rl.check("a", t0);
        rl.check("b", t0 + Duration::from_millis(900));
        rl.prune(t0 + Duration::from_millis(1500));
        assert_eq!(rl.tracked_senders(), 1);
    }
}
