//! In-memory token-bucket rate limiter.

use super::{LimitDecision, RateLimitError, RateLimiter};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::broadcast, time::Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: i64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn full(limit: i64) -> Self {
        let now = Instant::now();
        Self { tokens: limit, last_refill: now, last_access: now }
    }
}

/// Token-bucket rate limiter keyed on arbitrary strings.
///
/// Buckets are created lazily on first observation of a key and swept once
/// idle for more than two windows. Map access is sharded; each decision
/// holds the bucket's shard lock for the duration of the refill-and-consume
/// step, which makes quota enforcement exact rather than approximate under
/// contention.
pub struct MemoryRateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    max_tokens: i64,
    window: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl MemoryRateLimiter {
    /// Creates the limiter and starts its idle-bucket sweeper. Must be
    /// called from within a Tokio runtime.
    #[must_use]
    pub fn new(max_requests: i64, window: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let buckets = Arc::new(DashMap::new());

        Self::start_sweeper(Arc::clone(&buckets), idle_ttl(window), shutdown_rx);

        Self { buckets, max_tokens: max_requests, window, shutdown_tx }
    }

    fn start_sweeper(
        buckets: Arc<DashMap<String, TokenBucket>>,
        ttl: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Instant::now();
                        buckets.retain(|_, bucket| now.duration_since(bucket.last_access) <= ttl);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Removes buckets idle for more than two windows; returns how many were
    /// dropped. The background sweeper calls the same logic on a timer.
    pub fn sweep_idle(&self) -> usize {
        let ttl = idle_ttl(self.window);
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| now.duration_since(bucket.last_access) <= ttl);
        before - self.buckets.len()
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn consume(bucket: &mut TokenBucket, limit: i64, refill_rate: i64) -> LimitDecision {
        let now = Instant::now();
        bucket.last_access = now;

        let elapsed_secs = i64::try_from(now.duration_since(bucket.last_refill).as_secs())
            .unwrap_or(i64::MAX);
        let refilled = elapsed_secs.saturating_mul(refill_rate);
        if refilled > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refilled).min(limit);
            bucket.last_refill = now;
        }

        let allowed = bucket.tokens > 0;
        if allowed {
            bucket.tokens -= 1;
        }

        LimitDecision {
            allowed,
            remaining: if allowed { bucket.tokens } else { 0 },
            reset_at: reset_time(bucket.tokens, limit, refill_rate),
        }
    }
}

/// Buckets are kept around for twice the window before they count as idle.
fn idle_ttl(window: Duration) -> Duration {
    (window * 2).max(Duration::from_secs(1))
}

fn refill_rate(limit: i64, window: Duration) -> i64 {
    let window_secs = i64::try_from(window.as_secs().max(1)).unwrap_or(i64::MAX);
    (limit / window_secs).max(1)
}

/// When the bucket will be full again: `now + ceil(missing / rate)`, `now`
/// when already full.
fn reset_time(tokens: i64, limit: i64, refill_rate: i64) -> SystemTime {
    let now = SystemTime::now();
    if tokens >= limit {
        return now;
    }

    let needed = limit - tokens;
    let secs = (needed + refill_rate - 1) / refill_rate;
    now + Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, key: &str) -> LimitDecision {
        self.allow_with_limit(key, self.max_tokens, self.window).await
    }

    async fn allow_with_limit(&self, key: &str, limit: i64, window: Duration) -> LimitDecision {
        if limit <= 0 {
            return LimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: SystemTime::now() + window,
            };
        }

        let rate = refill_rate(limit, window);

        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return Self::consume(&mut bucket, limit, rate);
        }

        let mut bucket =
            self.buckets.entry(key.to_string()).or_insert_with(|| TokenBucket::full(limit));
        Self::consume(&mut bucket, limit, rate)
    }

    async fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    async fn health(&self) -> Result<(), RateLimitError> {
        // No external dependency; always healthy.
        Ok(())
    }

    async fn close(&self) {
        debug!("closing memory rate limiter");
        let _ = self.shutdown_tx.send(());
        self.buckets.clear();
    }
}
