//! Token-bucket rate limiting.
//!
//! Two backends sit behind the [`RateLimiter`] trait:
//!
//! - [`MemoryRateLimiter`]: per-key integer token buckets in a concurrent
//!   map, exact quota enforcement under contention, idle buckets swept every
//!   two windows.
//! - [`RedisRateLimiter`]: the same bucket semantics executed atomically in
//!   a Lua script, giving exact enforcement across a fleet of proxies. When
//!   Redis is unreachable the limiter fails open (admit) or closed (deny)
//!   per configuration.
//!
//! [`RateLimitManager`] wraps the active limiter with key construction,
//! header emission, and a periodic health monitor.

mod manager;
mod memory;
mod redis;

pub use manager::{RateLimitManager, RateLimitOutcome};
pub use memory::MemoryRateLimiter;
pub use redis::RedisRateLimiter;

use crate::config::{RateLimitBackendKind, RateLimitConfig, RateLimitHeadersConfig};
use async_trait::async_trait;
use http::HeaderMap;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by rate-limit backends. Backend outages never reach the
/// request path as errors; they are converted to allow/deny decisions by the
/// fail-open policy.
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("redis rate limiter error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("rate limiter health check timed out")]
    HealthTimeout,

    #[error("redis backend selected but no redis configuration block was provided")]
    MissingRedisConfig,
}

/// Outcome of one token-bucket consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    /// Tokens left after this attempt.
    pub remaining: i64,
    /// When the bucket will be full again.
    pub reset_at: SystemTime,
}

/// Limiter interface shared by the memory and Redis backends.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consumes a token for `key` under the limiter's configured defaults.
    async fn allow(&self, key: &str) -> LimitDecision;

    /// Consumes a token for `key` under an explicit limit and window.
    async fn allow_with_limit(&self, key: &str, limit: i64, window: Duration) -> LimitDecision;

    /// Forgets all state for `key`.
    async fn reset(&self, key: &str);

    /// Probes backend liveness.
    async fn health(&self) -> Result<(), RateLimitError>;

    /// Releases backend resources and stops background work. Idempotent.
    async fn close(&self);
}

/// Builds the configured limiter, or `None` when rate limiting is disabled.
///
/// # Errors
///
/// Returns [`RateLimitError::MissingRedisConfig`] when the Redis backend is
/// selected without its connection block.
pub fn build_limiter(
    config: &RateLimitConfig,
) -> Result<Option<Arc<dyn RateLimiter>>, RateLimitError> {
    if !config.enabled {
        return Ok(None);
    }

    let requests = config.requests.unwrap_or(100);
    let window = config.window.unwrap_or(Duration::from_secs(60));

    match config.storage.unwrap_or(RateLimitBackendKind::Memory) {
        RateLimitBackendKind::Memory => {
            Ok(Some(Arc::new(MemoryRateLimiter::new(requests, window))))
        }
        RateLimitBackendKind::Redis => {
            let redis = config.redis.as_ref().ok_or(RateLimitError::MissingRedisConfig)?;
            Ok(Some(Arc::new(RedisRateLimiter::new(redis, requests, window)?)))
        }
    }
}

/// Effective rate-limit policy for one route, computed once at startup.
///
/// The storage backend and its connection settings never appear here: they
/// are global-only and live with the limiter itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub requests: i64,
    pub window: Duration,
    /// Advisory; informs reset computation but carries no state of its own.
    pub block_duration: Duration,
    pub status_code: u16,
    pub message: String,
    pub key_by: Vec<String>,
    pub headers: Option<RateLimitHeadersConfig>,
}

impl RateLimitPolicy {
    /// Merges a route-level override over the (already defaulted) global
    /// rate-limit config.
    ///
    /// Rules: a missing route block means the global policy applies; a
    /// disabled route block disables limiting for the route; an enabled one
    /// keeps its own values and inherits missing scalars, the key list, and
    /// the header-emission block from the global config.
    pub fn resolve(global: &RateLimitConfig, route: Option<&RateLimitConfig>) -> Self {
        let source = route.unwrap_or(global);
        let enabled = source.enabled;

        let key_by = if source.key_by.is_empty() {
            global.key_by.clone()
        } else {
            source.key_by.clone()
        };

        Self {
            enabled,
            requests: source.requests.or(global.requests).unwrap_or(100),
            window: source.window.or(global.window).unwrap_or(Duration::from_secs(60)),
            block_duration: source
                .block_duration
                .or(global.block_duration)
                .unwrap_or(Duration::from_secs(60)),
            status_code: source.status_code.or(global.status_code).unwrap_or(429),
            message: source
                .message
                .clone()
                .filter(|m| !m.is_empty())
                .or_else(|| global.message.clone())
                .unwrap_or_else(|| "Rate limit exceeded".to_string()),
            key_by,
            headers: source.headers.or(global.headers),
        }
    }
}

/// Resolves the client IP: first comma-separated token of
/// `X-Forwarded-For`, else `X-Real-IP`, else the socket peer address.
#[must_use]
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    remote_addr.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

/// Builds the rate-limit key from the configured `keyBy` components, joined
/// with `:`.
///
/// `ip` resolves the client IP; `header:NAME` uses the raw header value,
/// falling back to the client IP when the header is absent so distinct
/// clients never coalesce onto an empty key; any other token is used
/// verbatim, which permits static sharding keys. An empty component list
/// falls back to the client IP.
#[must_use]
pub fn build_key(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    key_by: &[String],
) -> String {
    if key_by.is_empty() {
        return client_ip(headers, remote_addr);
    }

    let mut parts: Vec<String> = Vec::with_capacity(key_by.len());
    for component in key_by {
        if component == "ip" {
            parts.push(client_ip(headers, remote_addr));
        } else if let Some(name) = component.strip_prefix("header:") {
            match headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty()) {
                Some(value) => parts.push(value.to_string()),
                None => {
                    warn!(header = name, "rate-limit key header missing, falling back to client ip");
                    parts.push(client_ip(headers, remote_addr));
                }
            }
        } else {
            warn!(component = %component, "unknown rate-limit key component, using verbatim");
            parts.push(component.clone());
        }
    }

    if parts.is_empty() {
        return client_ip(headers, remote_addr);
    }

    parts.join(":")
}

/// Seconds until `reset_at`, rounded up; zero when already past.
#[must_use]
pub fn retry_after_secs(reset_at: SystemTime) -> u64 {
    match reset_at.duration_since(SystemTime::now()) {
        Ok(delta) => {
            let secs = delta.as_secs();
            if delta.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        }
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaulted_global() -> RateLimitConfig {
        let mut config = RateLimitConfig { enabled: true, ..RateLimitConfig::default() };
        config.apply_defaults();
        config
    }

    fn remote() -> Option<SocketAddr> {
        Some("203.0.113.7:4711".parse().unwrap())
    }

    #[test]
    fn resolve_without_route_uses_global() {
        let policy = RateLimitPolicy::resolve(&defaulted_global(), None);

        assert!(policy.enabled);
        assert_eq!(policy.requests, 100);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.status_code, 429);
        assert_eq!(policy.key_by, vec!["ip"]);
    }

    #[test]
    fn disabled_route_disables_limiting() {
        let route = RateLimitConfig::default();
        let policy = RateLimitPolicy::resolve(&defaulted_global(), Some(&route));
        assert!(!policy.enabled);
    }

    #[test]
    fn route_inherits_missing_scalars() {
        let route = RateLimitConfig {
            enabled: true,
            requests: Some(5),
            ..RateLimitConfig::default()
        };
        let policy = RateLimitPolicy::resolve(&defaulted_global(), Some(&route));

        assert_eq!(policy.requests, 5);
        assert_eq!(policy.window, Duration::from_secs(60));
        assert_eq!(policy.message, "Rate limit exceeded");
        assert_eq!(policy.key_by, vec!["ip"]);
    }

    #[test]
    fn route_overrides_win() {
        let route = RateLimitConfig {
            enabled: true,
            requests: Some(2),
            window: Some(Duration::from_secs(10)),
            status_code: Some(503),
            message: Some("busy".to_string()),
            key_by: vec!["header:X-API-Key".to_string()],
            ..RateLimitConfig::default()
        };
        let policy = RateLimitPolicy::resolve(&defaulted_global(), Some(&route));

        assert_eq!(policy.requests, 2);
        assert_eq!(policy.window, Duration::from_secs(10));
        assert_eq!(policy.status_code, 503);
        assert_eq!(policy.message, "busy");
        assert_eq!(policy.key_by, vec!["header:X-API-Key"]);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1, 10.0.0.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.9".parse().unwrap());

        assert_eq!(client_ip(&headers, remote()), "198.51.100.1");
    }

    #[test]
    fn client_ip_falls_back_to_real_ip_then_socket() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.9".parse().unwrap());
        assert_eq!(client_ip(&headers, remote()), "198.51.100.9");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, remote()), "203.0.113.7");
    }

    #[test]
    fn build_key_joins_components() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "abc".parse().unwrap());

        let key = build_key(
            &headers,
            remote(),
            &["ip".to_string(), "header:x-api-key".to_string()],
        );
        assert_eq!(key, "203.0.113.7:abc");
    }

    #[test]
    fn missing_key_header_falls_back_to_ip() {
        let headers = HeaderMap::new();
        let key = build_key(&headers, remote(), &["header:x-api-key".to_string()]);
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn unknown_component_used_verbatim() {
        let headers = HeaderMap::new();
        let key = build_key(&headers, remote(), &["shard-7".to_string()]);
        assert_eq!(key, "shard-7");
    }

    #[test]
    fn empty_key_by_falls_back_to_ip() {
        let headers = HeaderMap::new();
        assert_eq!(build_key(&headers, remote(), &[]), "203.0.113.7");
    }

    #[test]
    fn retry_after_rounds_up() {
        let reset = SystemTime::now() + Duration::from_millis(1500);
        let secs = retry_after_secs(reset);
        assert!(secs == 2 || secs == 1, "{secs}");

        assert_eq!(retry_after_secs(SystemTime::now() - Duration::from_secs(5)), 0);
    }
}
