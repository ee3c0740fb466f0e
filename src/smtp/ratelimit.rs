//! Per-IP token bucket over authentication failures. Once an address burns
//! through its budget inside the window it is denied until the window rolls
//! over.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

pub struct AuthRateLimiter {
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    limit: u32,
    window: ChronoDuration,
}

struct Bucket {
    failures: u32,
    window_start: DateTime<Utc>,
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(10 * 60))
    }
}

impl AuthRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window: ChronoDuration::from_std(window).unwrap_or_default(),
        }
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.is_blocked_at(ip, Utc::now())
    }

    pub fn record_failure(&self, ip: IpAddr) {
        self.record_failure_at(ip, Utc::now())
    }

    fn is_blocked_at(&self, ip: IpAddr, now: DateTime<Utc>) -> bool {
        let mut buckets = self.buckets.lock().expect("limiter poisoned");
        match buckets.get(&ip) {
            Some(bucket) if now - bucket.window_start < self.window => {
                bucket.failures >= self.limit
            }
            Some(_) => {
                buckets.remove(&ip);
                false
            }
            None => false,
        }
    }

    fn record_failure_at(&self, ip: IpAddr, now: DateTime<Utc>) {
        let mut buckets = self.buckets.lock().expect("limiter poisoned");
        let bucket = buckets.entry(ip).or_insert(Bucket {
            failures: 0,
            window_start: now,
        });
        if now - bucket.window_start >= self.window {
            bucket.failures = 0;
            bucket.window_start = now;
        }
        bucket.failures += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_after_limit_within_window() {
        let limiter = AuthRateLimiter::new(3, Duration::from_secs(600));
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let now = Utc::now();

        for _ in 0..2 {
            limiter.record_failure_at(ip, now);
        }
        assert!(!limiter.is_blocked_at(ip, now));

        limiter.record_failure_at(ip, now);
        assert!(limiter.is_blocked_at(ip, now + ChronoDuration::seconds(1)));

        // other addresses are unaffected
        assert!(!limiter.is_blocked_at("192.0.2.2".parse().unwrap(), now));
    }

    #[test]
    fn deny_lifts_when_the_window_rolls_over() {
        let limiter = AuthRateLimiter::new(2, Duration::from_secs(600));
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let now = Utc::now();

        limiter.record_failure_at(ip, now);
        limiter.record_failure_at(ip, now);
        assert!(limiter.is_blocked_at(ip, now + ChronoDuration::seconds(599)));
        assert!(!limiter.is_blocked_at(ip, now + ChronoDuration::seconds(601)));
    }
}
