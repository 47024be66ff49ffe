//! Bounded exponential backoff per target (spec §3 "Authentication-limiter", §9 glossary
//! "TimeLimiter"). Grounded on `original_source/pkg/socket/limiter/limiter.go`.

use hashbrown::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Limit {
    expire_at: Instant,
    magnification: u32,
}

pub struct TimeLimiter {
    interval: Duration,
    targets: RwLock<HashMap<String, Limit>>,
}

impl TimeLimiter {
    pub fn new(interval: Duration) -> Self {
        TimeLimiter {
            interval,
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Records a failed attempt: extends `expire_at` by `interval * magnification`, then
    /// doubles the magnification for next time (spec §3, testable property #7).
    pub fn hit(&self, target: &str) {
        let mut targets = self.targets.write().unwrap();
        let now = Instant::now();
        let entry = targets.entry(target.to_string()).or_insert(Limit {
            expire_at: now,
            magnification: 1,
        });
        entry.expire_at = now + self.interval * entry.magnification;
        entry.magnification = entry.magnification.saturating_mul(2);
    }

    pub fn release(&self, target: &str) {
        self.targets.write().unwrap().remove(target);
    }

    /// `true` iff no unexpired record exists for `target` (spec invariant #4).
    pub fn access(&self, target: &str) -> bool {
        match self.targets.read().unwrap().get(target) {
            Some(limit) => Instant::now() >= limit.expire_at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_hit_blocks_for_at_least_one_interval() {
        let limiter = TimeLimiter::new(Duration::from_millis(50));
        assert!(limiter.access("dev-7"));
        limiter.hit("dev-7");
        assert!(!limiter.access("dev-7"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.access("dev-7"));
    }

    #[test]
    fn second_hit_doubles_the_backoff() {
        let limiter = TimeLimiter::new(Duration::from_millis(40));
        limiter.hit("dev-7");
        std::thread::sleep(Duration::from_millis(45));
        assert!(limiter.access("dev-7"));

        limiter.hit("dev-7");
        limiter.hit("dev-7");
        std::thread::sleep(Duration::from_millis(45));
        // Second consecutive failure doubles the window; 45ms alone should not clear it.
        assert!(!limiter.access("dev-7"));
    }

    #[test]
    fn release_clears_the_record() {
        let limiter = TimeLimiter::new(Duration::from_secs(10));
        limiter.hit("dev-7");
        assert!(!limiter.access("dev-7"));
        limiter.release("dev-7");
        assert!(limiter.access("dev-7"));
    }
}
