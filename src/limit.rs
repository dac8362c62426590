use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const IDLE_EVICT_AFTER: Duration = Duration::from_secs(180);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Per-key token-bucket rate limiter. Buckets refill continuously at `rps`
/// up to `burst`; keys idle longer than three minutes are dropped by the
/// janitor.
pub struct IpRateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rps: f64,
    burst: f64,
}

impl IpRateLimiter {
    pub fn new(rps: f64, burst: u32) -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            rps: rps.max(0.0),
            burst: f64::from(burst).max(1.0),
        })
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.buckets.lock().unwrap();
        let bucket = guard.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn sweep_idle(&self) {
        self.sweep_idle_at(Instant::now());
    }

    fn sweep_idle_at(&self, now: Instant) {
        let mut guard = self.buckets.lock().unwrap();
        guard.retain(|_, b| now.saturating_duration_since(b.last_seen) < IDLE_EVICT_AFTER);
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

/// Periodically evicts idle rate-limiter keys; aborted on shutdown.
pub fn spawn_janitor(limiters: Vec<Arc<IpRateLimiter>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            for limiter in &limiters {
                limiter.sweep_idle();
            }
        }
    })
}

#[derive(Debug, Default)]
struct ConnCounts {
    per_ip: HashMap<String, usize>,
    total: usize,
}

/// Two-level live-connection counter: per-ip cap and global cap, both
/// checked under one lock so the increment is atomic against both.
pub struct ConnLimiter {
    counts: Mutex<ConnCounts>,
    max_per_ip: usize,
    max_global: usize,
}

impl ConnLimiter {
    pub fn new(max_per_ip: usize, max_global: usize) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(ConnCounts::default()),
            max_per_ip,
            max_global,
        })
    }

    /// Reserve a connection slot for `ip`. Returns false when either cap
    /// would be exceeded; nothing is counted in that case.
    pub fn acquire(&self, ip: &str) -> bool {
        let mut guard = self.counts.lock().unwrap();
        if guard.total >= self.max_global {
            return false;
        }
        let count = guard.per_ip.entry(ip.to_string()).or_insert(0);
        if *count >= self.max_per_ip {
            return false;
        }
        *count += 1;
        guard.total += 1;
        true
    }

    pub fn release(&self, ip: &str) {
        let mut guard = self.counts.lock().unwrap();
        if let Some(count) = guard.per_ip.get_mut(ip) {
            *count -= 1;
            if *count == 0 {
                guard.per_ip.remove(ip);
            }
            guard.total -= 1;
        }
    }

    pub fn total(&self) -> usize {
        self.counts.lock().unwrap().total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_denies() {
        let limiter = IpRateLimiter::new(1.0, 3);
        for _ in 0..3 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
        // Other keys are independent.
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn bucket_refills_over_time() {
        let limiter = IpRateLimiter::new(50.0, 1);
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow("1.2.3.4"));
    }

    #[test]
    fn sweep_drops_idle_keys() {
        let limiter = IpRateLimiter::new(1.0, 1);
        assert!(limiter.allow("1.2.3.4"));
        assert_eq!(limiter.tracked_keys(), 1);
        limiter.sweep_idle_at(Instant::now() + IDLE_EVICT_AFTER);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn conn_limiter_enforces_per_ip_cap() {
        let limiter = ConnLimiter::new(2, 10);
        assert!(limiter.acquire("1.1.1.1"));
        assert!(limiter.acquire("1.1.1.1"));
        assert!(!limiter.acquire("1.1.1.1"));
        assert!(limiter.acquire("2.2.2.2"));

        limiter.release("1.1.1.1");
        assert!(limiter.acquire("1.1.1.1"));
        assert_eq!(limiter.total(), 3);
    }

    #[test]
    fn conn_limiter_enforces_global_cap() {
        let limiter = ConnLimiter::new(10, 2);
        assert!(limiter.acquire("1.1.1.1"));
        assert!(limiter.acquire("2.2.2.2"));
        assert!(!limiter.acquire("3.3.3.3"));

        limiter.release("1.1.1.1");
        assert!(limiter.acquire("3.3.3.3"));
    }

    #[test]
    fn release_of_unknown_ip_is_harmless() {
        let limiter = ConnLimiter::new(1, 1);
        limiter.release("9.9.9.9");
        assert_eq!(limiter.total(), 0);
        assert!(limiter.acquire("9.9.9.9"));
    }
}
