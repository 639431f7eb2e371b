//! Redis-backed distributed token-bucket rate limiter.
//!
//! Bucket state lives in a Redis hash (`tokens`, `last_refill`) under a
//! namespaced key, mutated by a single Lua script so the
//! read-refill-consume-write cycle is atomic across every proxy instance
//! sharing the Redis. Each key expires after two windows of inactivity.
//!
//! When Redis cannot be reached within the per-call timeout, the limiter
//! applies the configured outage policy: fail open (admit, availability
//! wins) or fail closed (deny, security wins).

use super::{LimitDecision, RateLimitError, RateLimiter};
use crate::cache::redis::open_client as open_redis_client;
use crate::config::RedisConfig;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_NAMESPACE: &str = "hermyx:ratelimit:";

const EVAL_TIMEOUT: Duration = Duration::from_millis(500);
const DEL_TIMEOUT: Duration = Duration::from_secs(1);
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Atomic token-bucket step. Returns `{allowed, tokens, reset-unix-secs}`.
const TOKEN_BUCKET_SCRIPT: &str = r"
local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local window = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1]) or max_tokens
local last_refill = tonumber(state[2]) or now

local elapsed = now - last_refill
local tokens_to_add = math.floor(elapsed * refill_rate)

if tokens_to_add > 0 then
    tokens = math.min(tokens + tokens_to_add, max_tokens)
    last_refill = now
end

local allowed = 0
if tokens > 0 then
    tokens = tokens - 1
    allowed = 1
end

redis.call('HMSET', key, 'tokens', tokens, 'last_refill', last_refill)
redis.call('EXPIRE', key, window * 2)

local tokens_needed = max_tokens - tokens
local seconds_to_reset = 0
if tokens_needed > 0 and refill_rate > 0 then
    seconds_to_reset = math.ceil(tokens_needed / refill_rate)
end

return {allowed, tokens, now + seconds_to_reset}
";

/// Distributed token-bucket limiter backed by Redis.
pub struct RedisRateLimiter {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    script: redis::Script,
    namespace: String,
    max_tokens: i64,
    window: Duration,
    fail_open: bool,
}

impl RedisRateLimiter {
    /// Creates the limiter. Does not connect; the first check does.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured address cannot be parsed.
    pub fn new(
        config: &RedisConfig,
        max_requests: i64,
        window: Duration,
    ) -> Result<Self, RateLimitError> {
        let client = open_redis_client(config)?;

        let mut namespace =
            config.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if !namespace.ends_with(':') {
            namespace.push(':');
        }

        Ok(Self {
            client,
            conn: Mutex::new(None),
            script: redis::Script::new(TOKEN_BUCKET_SCRIPT),
            namespace,
            max_tokens: max_requests,
            window,
            fail_open: config.fail_open.unwrap_or(true),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }

    /// Decision applied when Redis is unreachable or returns garbage.
    fn outage_decision(&self, limit: i64, window: Duration, now: SystemTime) -> LimitDecision {
        if self.fail_open {
            LimitDecision { allowed: true, remaining: limit, reset_at: now + window }
        } else {
            LimitDecision { allowed: false, remaining: 0, reset_at: now + window }
        }
    }

    async fn run_script(
        &self,
        key: &str,
        limit: i64,
        refill_rate: f64,
        now_unix: i64,
        window_secs: i64,
    ) -> Result<(i64, i64, i64), redis::RedisError> {
        let mut conn = self.connection().await?;
        self.script
            .key(self.namespaced(key))
            .arg(limit)
            .arg(refill_rate)
            .arg(now_unix)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, key: &str) -> LimitDecision {
        self.allow_with_limit(key, self.max_tokens, self.window).await
    }

    async fn allow_with_limit(&self, key: &str, limit: i64, window: Duration) -> LimitDecision {
        let now = SystemTime::now();

        if limit <= 0 {
            return LimitDecision { allowed: false, remaining: 0, reset_at: now + window };
        }

        let window_secs = i64::try_from(window.as_secs().max(1)).unwrap_or(i64::MAX);
        let refill_rate = (limit as f64 / window_secs as f64).max(0.01);
        let now_unix = now
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));

        let outcome = tokio::time::timeout(
            EVAL_TIMEOUT,
            self.run_script(key, limit, refill_rate, now_unix, window_secs),
        )
        .await;

        match outcome {
            Ok(Ok((allowed, tokens, reset_unix))) => LimitDecision {
                allowed: allowed == 1,
                remaining: tokens,
                reset_at: UNIX_EPOCH + Duration::from_secs(u64::try_from(reset_unix).unwrap_or(0)),
            },
            Ok(Err(e)) => {
                warn!(error = %e, fail_open = self.fail_open, "redis rate-limit eval failed");
                self.invalidate().await;
                self.outage_decision(limit, window, now)
            }
            Err(_) => {
                warn!(fail_open = self.fail_open, "redis rate-limit eval timed out");
                self.invalidate().await;
                self.outage_decision(limit, window, now)
            }
        }
    }

    async fn reset(&self, key: &str) {
        let namespaced = self.namespaced(key);
        let outcome = tokio::time::timeout(DEL_TIMEOUT, async {
            let mut conn = self.connection().await?;
            redis::cmd("DEL").arg(&namespaced).query_async::<()>(&mut conn).await
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, key, "redis rate-limit reset failed");
                self.invalidate().await;
            }
            Err(_) => {
                debug!(key, "redis rate-limit reset timed out");
                self.invalidate().await;
            }
        }
    }

    async fn health(&self) -> Result<(), RateLimitError> {
        let outcome = tokio::time::timeout(PING_TIMEOUT, async {
            let mut conn = self.connection().await?;
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await;

        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.invalidate().await;
                Err(e.into())
            }
            Err(_) => {
                self.invalidate().await;
                Err(RateLimitError::HealthTimeout)
            }
        }
    }

    async fn close(&self) {
        debug!("closing redis rate limiter");
        self.invalidate().await;
    }
}
