use crate::config::RateLimitConfig;
use dashmap::DashMap;
use std::borrow::Cow;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// In-process rate limiter backing the flow verdict.
///
/// Two modes:
/// - Token bucket (mode "req"): smooth rate limiting with burst.
/// - Sliding window (mode "count"): count per window, blending in the
///   previous window so two adjacent windows cannot pass twice the limit.
///
/// Entries idle for `GC_EXPIRE_SECS` are evicted by the GC task so per-client
/// or per-uri keys cannot grow without bound.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    windows: DashMap<String, Arc<SlidingWindow>>,
    /// Zero point for the microsecond timestamps below. Taken from the tokio
    /// clock so paused-time tests can advance it.
    epoch: Instant,
}

/// The lock is a `tokio::sync::Mutex` so contended callers yield instead of
/// blocking a worker thread.
struct Bucket {
    inner: Mutex<BucketInner>,
    /// Microseconds since the limiter epoch; updated outside the lock.
    last_access: AtomicU64,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

/// estimated = prev_count * (1 - elapsed_ratio) + current_count
struct SlidingWindow {
    inner: Mutex<SlidingWindowInner>,
    last_access: AtomicU64,
}

struct SlidingWindowInner {
    current_count: u64,
    prev_count: u64,
    window_start: u64,
    max_count: u64,
    window_us: u64,
}

const GC_EXPIRE_SECS: u64 = 300;
const GC_INTERVAL_SECS: u64 = 60;
/// Hard cap per map; the oldest entries beyond it are force-evicted.
const MAX_ENTRIES: usize = 100_000;
const PRECISION: u64 = 1_000_000;

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
            windows: DashMap::new(),
            epoch: Instant::now(),
        }
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, config: &RateLimitConfig, key: &str) -> bool {
        match config.mode.as_str() {
            "count" => self.check_sliding_window(config, key).await,
            _ => self.check_token_bucket(config, key).await,
        }
    }

    async fn check_token_bucket(&self, config: &RateLimitConfig, key: &str) -> bool {
        let rate = config.rate.unwrap_or(100.0);
        let burst = config.burst.unwrap_or(rate as u64).max(1);
        let max_tokens = (rate as u64 + burst) * PRECISION;
        let rate_per_us = rate / 1_000_000.0;

        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = self.now_us();
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: max_tokens,
                            last_refill: now,
                            rate_per_us,
                            max_tokens,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        let now = self.now_us();
        bucket.last_access.store(now, Ordering::Relaxed);
        bucket.try_acquire(now).await
    }

    async fn check_sliding_window(&self, config: &RateLimitConfig, key: &str) -> bool {
        let max_count = config.count.unwrap_or(1000).max(1);
        let window_secs = config.time_window.unwrap_or(1).max(1);

        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| {
                    let now = self.now_us();
                    Arc::new(SlidingWindow {
                        inner: Mutex::new(SlidingWindowInner {
                            current_count: 0,
                            prev_count: 0,
                            window_start: now,
                            max_count,
                            window_us: window_secs * 1_000_000,
                        }),
                        last_access: AtomicU64::new(now),
                    })
                })
                .clone()
        };

        let now = self.now_us();
        window.last_access.store(now, Ordering::Relaxed);
        window.try_acquire(now).await
    }

    /// Counter key for a request.
    ///
    /// - `"route"`: one counter per route (default)
    /// - `"remote_addr"`: per client IP
    /// - `"uri"`: per request path (dynamic paths make many keys)
    pub fn extract_key<'a>(
        config: &RateLimitConfig,
        route_id: &'a str,
        path: &'a str,
        client_ip: &IpAddr,
    ) -> Cow<'a, str> {
        match config.key.as_str() {
            "remote_addr" => Cow::Owned(format!("{}|{}", route_id, client_ip)),
            "uri" => Cow::Borrowed(path),
            _ => Cow::Borrowed(route_id),
        }
    }

    /// Spawn the periodic eviction task. Call once after construction.
    pub fn start_gc(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                limiter.evict_stale();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.len() + self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_stale(&self) {
        let now = self.now_us();
        let expire_us = GC_EXPIRE_SECS * 1_000_000;

        self.buckets
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        if self.buckets.len() > MAX_ENTRIES {
            force_evict(&self.buckets, now, |b| &b.last_access);
        }

        self.windows
            .retain(|_, v| now.saturating_sub(v.last_access.load(Ordering::Relaxed)) < expire_us);
        if self.windows.len() > MAX_ENTRIES {
            force_evict(&self.windows, now, |w| &w.last_access);
        }
    }
}

/// Drop the oldest entries until the map is back under `MAX_ENTRIES`.
fn force_evict<T>(map: &DashMap<String, Arc<T>>, now: u64, last_access: impl Fn(&T) -> &AtomicU64) {
    let overflow = map.len().saturating_sub(MAX_ENTRIES);
    if overflow == 0 {
        return;
    }
    let mut entries: Vec<(String, u64)> = map
        .iter()
        .map(|r| {
            let age = now.saturating_sub(last_access(r.value()).load(Ordering::Relaxed));
            (r.key().clone(), age)
        })
        .collect();
    entries.sort_unstable_by(|a, b| b.1.cmp(&a.1));
    for (key, _) in entries.into_iter().take(overflow) {
        map.remove(&key);
    }
}

impl Bucket {
    async fn try_acquire(&self, now: u64) -> bool {
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = (b.tokens + refill).min(b.max_tokens);
            b.last_refill = now;
        }

        if b.tokens >= PRECISION {
            b.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

impl SlidingWindow {
    async fn try_acquire(&self, now: u64) -> bool {
        let mut w = self.inner.lock().await;

        // Idle for two or more windows: nothing from before still counts.
        if now.saturating_sub(w.window_start) >= 2 * w.window_us {
            let skipped = (now - w.window_start) / w.window_us;
            w.window_start += skipped * w.window_us;
            w.prev_count = 0;
            w.current_count = 0;
        } else if now.saturating_sub(w.window_start) >= w.window_us {
            w.prev_count = w.current_count;
            w.current_count = 0;
            w.window_start += w.window_us;
        }

        let elapsed_in_window = now.saturating_sub(w.window_start);
        let weight = 1.0 - (elapsed_in_window as f64 / w.window_us as f64);
        let estimated = (w.prev_count as f64 * weight) as u64 + w.current_count;

        if estimated < w.max_count {
            w.current_count += 1;
            true
        } else {
            false
        }
    }
}
