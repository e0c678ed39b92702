use std::{net::IpAddr, ops::Deref, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::args::RateLimiterArgs;

pub mod middleware;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Sustained admission rate in requests per second
    pub rate_per_sec: f64,
    /// Bucket capacity; also the initial fill for a fresh identity
    pub burst: f64,
    /// Buckets untouched for this long are evicted by the sweeper
    pub idle_evict: Duration,
}

impl RateLimiterConfig {
    pub fn general(args: &RateLimiterArgs) -> Self {
        Self {
            rate_per_sec: args.rate_per_sec,
            burst: args.burst as f64,
            idle_evict: Duration::from_secs(args.idle_evict_secs),
        }
    }

    /// Stricter bucket applied to authentication endpoints.
    pub fn auth(args: &RateLimiterArgs) -> Self {
        Self {
            rate_per_sec: args.auth_rate_per_sec,
            burst: args.auth_burst as f64,
            idle_evict: Duration::from_secs(args.idle_evict_secs),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 10.0,
            burst: 30.0,
            idle_evict: Duration::from_secs(300),
        }
    }
}

struct Bucket {
    tokens: f64,
    touched: Instant,
}

pub struct RateLimiterInner {
    buckets: DashMap<IpAddr, Bucket>,
    config: RateLimiterConfig,
}

/// Per-identity token buckets. Identity is the direct peer address; the
/// middleware never derives it from a forwarded header.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

impl Deref for RateLimiter {
    type Target = RateLimiterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                buckets: DashMap::new(),
                config,
            }),
        }
    }

    /// Returns true if the request is admitted. No work happens on denial.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.config.burst,
            touched: now,
        });
        let bucket = entry.value_mut();
        let elapsed = now.duration_since(bucket.touched).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.rate_per_sec).min(self.config.burst);
        bucket.touched = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle past the eviction window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let idle = self.config.idle_evict;
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.touched) < idle);
    }

    pub fn spawn_sweeper(&self, cancel: CancellationToken) {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => limiter.sweep(),
                }
            }
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
