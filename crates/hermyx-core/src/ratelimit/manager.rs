//! Rate-limit manager: key construction, limiter invocation, header
//! emission, and the periodic backend health monitor.

use super::{build_key, LimitDecision, RateLimitPolicy, RateLimiter};
use http::{header::HeaderName, HeaderMap, HeaderValue};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

static LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Result of the rate-limit pre-hook for one request.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub remaining: i64,
    pub limit: i64,
    pub reset_at: Option<SystemTime>,
    pub key: Option<String>,
}

impl RateLimitOutcome {
    /// Sentinel outcome for requests that bypass rate limiting entirely.
    fn pass_through() -> Self {
        Self { allowed: true, remaining: -1, limit: -1, reset_at: None, key: None }
    }
}

/// Owns the active limiter and its health monitor.
pub struct RateLimitManager {
    limiter: Option<Arc<dyn RateLimiter>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl RateLimitManager {
    /// Creates the manager and, when a limiter is present, starts the 30 s
    /// health monitor. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(limiter: Option<Arc<dyn RateLimiter>>) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        if let Some(limiter) = &limiter {
            Self::start_health_monitor(Arc::clone(limiter), shutdown_rx);
        }

        Self { limiter, shutdown_tx, closed: AtomicBool::new(false) }
    }

    fn start_health_monitor(
        limiter: Arc<dyn RateLimiter>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup isn't
            // serialized behind a backend probe.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = limiter.health().await {
                            error!(error = %e, "rate limiter health check failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Runs the rate-limit check for a request.
    ///
    /// A null or disabled policy, an absent limiter, or an underivable key
    /// all admit the request with sentinel values; limiting is never allowed
    /// to take down traffic it cannot attribute.
    pub async fn check(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
        policy: Option<&RateLimitPolicy>,
    ) -> RateLimitOutcome {
        let Some(limiter) = &self.limiter else {
            return RateLimitOutcome::pass_through();
        };
        let Some(policy) = policy else {
            return RateLimitOutcome::pass_through();
        };
        if !policy.enabled {
            debug!("rate limiting disabled for this route");
            return RateLimitOutcome::pass_through();
        }

        let key = build_key(headers, remote_addr, &policy.key_by);
        if key.is_empty() {
            warn!("cannot derive rate-limit key, allowing request");
            return RateLimitOutcome::pass_through();
        }

        let decision: LimitDecision =
            limiter.allow_with_limit(&key, policy.requests, policy.window).await;

        if decision.allowed {
            debug!(
                key = %key,
                remaining = decision.remaining,
                limit = policy.requests,
                "rate limit check passed"
            );
        } else {
            warn!(key = %key, limit = policy.requests, "rate limit exceeded");
        }

        RateLimitOutcome {
            allowed: decision.allowed,
            remaining: decision.remaining,
            limit: policy.requests,
            reset_at: Some(decision.reset_at),
            key: Some(key),
        }
    }

    /// Emits `X-RateLimit-*` headers according to the policy's header block.
    /// A null block emits nothing.
    pub fn set_headers(
        &self,
        headers: &mut HeaderMap,
        outcome: &RateLimitOutcome,
        policy: Option<&RateLimitPolicy>,
    ) {
        let Some(header_config) = policy.and_then(|p| p.headers.as_ref()) else {
            return;
        };

        if header_config.include_limit {
            if let Ok(value) = HeaderValue::from_str(&outcome.limit.to_string()) {
                headers.insert(LIMIT_HEADER.clone(), value);
            }
        }
        if header_config.include_remaining {
            if let Ok(value) = HeaderValue::from_str(&outcome.remaining.to_string()) {
                headers.insert(REMAINING_HEADER.clone(), value);
            }
        }
        if header_config.include_reset {
            let reset_unix = outcome
                .reset_at
                .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| d.as_secs());
            if let Ok(value) = HeaderValue::from_str(&reset_unix.to_string()) {
                headers.insert(RESET_HEADER.clone(), value);
            }
        }
    }

    /// Resets the quota for a specific key.
    pub async fn reset(&self, key: &str) {
        if let Some(limiter) = &self.limiter {
            limiter.reset(key).await;
        }
    }

    /// Stops the health monitor and closes the limiter. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        if let Some(limiter) = &self.limiter {
            limiter.close().await;
        }
    }
}
