//! The request pipeline.
//!
//! For every inbound request: rate-limit gate, route match, cache probe,
//! upstream dispatch, conditional cache store, response shaping. Steps run
//! sequentially within a request; requests run concurrently against the
//! shared (immutable) route table and the thread-safe managers.

use super::{ProxyError, UpstreamPool, CACHE_STATUS_HEADER};
use crate::{
    cache::{fingerprint, CacheManager},
    ratelimit::{retry_after_secs, RateLimitManager, RateLimitOutcome, RateLimitPolicy},
    routing::RouteTable,
};
use axum::body::Body;
use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, HeaderValue, Request, Response, StatusCode};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

static RETRY_AFTER: HeaderName = HeaderName::from_static("retry-after");
static CACHE_STATUS: HeaderName = HeaderName::from_static(CACHE_STATUS_HEADER);

/// Composes the route table, cache manager, rate-limit manager, and
/// upstream pool into the per-request pipeline.
pub struct ProxyEngine {
    routes: RouteTable,
    cache: CacheManager,
    rate_limit: RateLimitManager,
    upstreams: UpstreamPool,
}

impl ProxyEngine {
    /// Wires the pipeline together and eagerly builds upstream clients for
    /// every configured route target.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ClientBuild`] when a per-target client cannot
    /// be constructed.
    pub fn new(
        routes: RouteTable,
        cache: CacheManager,
        rate_limit: RateLimitManager,
        upstreams: UpstreamPool,
    ) -> Result<Self, ProxyError> {
        upstreams.prepare(routes.targets())?;
        Ok(Self { routes, cache, rate_limit, upstreams })
    }

    /// Handles one request end to end. Never panics; every failure maps to
    /// a plain-text error response.
    pub async fn handle(&self, request: Request<Body>, remote_addr: Option<SocketAddr>) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or_default().to_string();
        let method = parts.method.as_str().to_lowercase();

        info!(method = %method, path = %path, "incoming request");

        // Rate-limit gate. The rate-limit matcher honors path filters but
        // ignores cache method exclusions.
        let rate_limit_policy =
            self.routes.match_for_rate_limit(&path).map(|route| route.rate_limit.clone());
        let outcome =
            self.rate_limit.check(&parts.headers, remote_addr, rate_limit_policy.as_ref()).await;

        if !outcome.allowed {
            return self.denial_response(&outcome, rate_limit_policy.as_ref());
        }

        let body = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to buffer request body");
                return self.finish(
                    text_response(StatusCode::BAD_REQUEST, "Unable to read request body"),
                    &outcome,
                    rate_limit_policy.as_ref(),
                );
            }
        };

        // Route match for cache and dispatch. An excluded method reports
        // "no match" here and takes the fallback path below.
        let Some(route) = self.routes.match_for_cache(&path, &method) else {
            debug!(path = %path, "no route matched, proxying by host header");
            let response = self
                .fallback_proxy(&parts.method, &path, &query, &parts.headers, body)
                .await;
            return self.finish(response, &outcome, rate_limit_policy.as_ref());
        };

        // Cache probe.
        let mut cache_key = None;
        if route.cache.enabled {
            let Some(key_policy) = &route.cache.key else {
                error!(route = %route.name, "cache enabled but key policy is missing");
                return self.finish(
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
                    &outcome,
                    rate_limit_policy.as_ref(),
                );
            };

            let key = fingerprint(key_policy, &method, &path, &query, &parts.headers);
            debug!(key = %key, "cache key generated");

            match self.cache.get(&key).await {
                Ok(Some(cached)) => {
                    info!(key = %key, path = %path, "cache hit");
                    let mut response = Response::builder()
                        .status(StatusCode::OK)
                        .body(Body::from(cached))
                        .unwrap_or_default();
                    response.headers_mut().insert(CACHE_STATUS.clone(), HeaderValue::from_static("HIT"));
                    return self.finish(response, &outcome, rate_limit_policy.as_ref());
                }
                Ok(None) => {
                    info!(key = %key, path = %path, "cache miss");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "cache read failed, treating as miss");
                }
            }
            cache_key = Some(key);
        }

        // Upstream dispatch.
        let full_path = path_and_query(&path, &query);
        let dispatched = self
            .upstreams
            .dispatch(&route.target, &parts.method, &full_path, &parts.headers, body)
            .await;

        let (status, upstream_headers, response_body) = match dispatched {
            Ok(result) => result,
            Err(e) => {
                error!(route = %route.name, target = %route.target, error = %e, "proxy error");
                return self.finish(
                    text_response(StatusCode::BAD_GATEWAY, &format!("Proxy error: {e}")),
                    &outcome,
                    rate_limit_policy.as_ref(),
                );
            }
        };

        // Conditional cache store: 2xx only, bounded by the per-entry size
        // ceiling. Write failures are logged and dropped; the response is
        // already on its way out.
        if let Some(key) = cache_key {
            if status.is_success()
                && response_body.len() as u64 <= route.cache.max_content_size
            {
                if let Err(e) =
                    self.cache.set(&key, response_body.to_vec(), route.cache.ttl).await
                {
                    warn!(key = %key, error = %e, "cache write failed");
                } else {
                    info!(key = %key, ttl_secs = route.cache.ttl.as_secs(), "response cached");
                }
            } else if status.is_success() {
                debug!(
                    key = %key,
                    bytes = response_body.len(),
                    limit = route.cache.max_content_size,
                    "response exceeds max cache size, skipping store"
                );
            }
        }

        let mut response = Response::builder()
            .status(status)
            .body(Body::from(response_body))
            .unwrap_or_default();
        *response.headers_mut() = upstream_headers;
        if route.cache.enabled {
            response
                .headers_mut()
                .insert(CACHE_STATUS.clone(), HeaderValue::from_static("MISS"));
        }

        self.finish(response, &outcome, rate_limit_policy.as_ref())
    }

    /// Builds the denial response: configured status, denial message as the
    /// body, `Retry-After`, and the policy's rate-limit headers. Headers are
    /// set before the body is attached.
    fn denial_response(
        &self,
        outcome: &RateLimitOutcome,
        policy: Option<&RateLimitPolicy>,
    ) -> Response<Body> {
        let status = policy
            .map(|p| p.status_code)
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
        let message =
            policy.map_or_else(|| "Rate limit exceeded".to_string(), |p| p.message.clone());

        let mut headers = HeaderMap::new();
        self.rate_limit.set_headers(&mut headers, outcome, policy);
        if let Some(reset_at) = outcome.reset_at {
            let delta = retry_after_secs(reset_at);
            if let Ok(value) = HeaderValue::from_str(&delta.to_string()) {
                headers.insert(RETRY_AFTER.clone(), value);
            }
        }

        let mut response = Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_default();
        response.headers_mut().extend(headers);
        response
    }

    /// Legacy fallback for unmatched requests: 404 without a `Host` header,
    /// best-effort proxy to the host value otherwise.
    async fn fallback_proxy(
        &self,
        method: &http::Method,
        path: &str,
        query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response<Body> {
        let host = headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if host.is_empty() {
            warn!("no host header on unmatched request, returning 404");
            return text_response(
                StatusCode::NOT_FOUND,
                "No route matched and no Host header present",
            );
        }

        info!(host = %host, "fallback proxying by host header");
        let full_path = path_and_query(path, query);
        match self.upstreams.dispatch(host, method, &full_path, headers, body).await {
            Ok((status, upstream_headers, response_body)) => {
                let mut response = Response::builder()
                    .status(status)
                    .body(Body::from(response_body))
                    .unwrap_or_default();
                *response.headers_mut() = upstream_headers;
                response
            }
            Err(e) => {
                error!(host = %host, error = %e, "fallback proxy error");
                text_response(StatusCode::BAD_GATEWAY, &format!("Fallback proxy error: {e}"))
            }
        }
    }

    /// Tags a response with the rate-limit headers from the pre-hook result.
    fn finish(
        &self,
        mut response: Response<Body>,
        outcome: &RateLimitOutcome,
        policy: Option<&RateLimitPolicy>,
    ) -> Response<Body> {
        let mut headers = HeaderMap::new();
        self.rate_limit.set_headers(&mut headers, outcome, policy);
        response.headers_mut().extend(headers);
        response
    }

    /// Closes the cache backend and the rate-limit manager.
    pub async fn shutdown(&self) {
        if let Err(e) = self.cache.close().await {
            error!(error = %e, "failed to close the cache backend");
        }
        self.rate_limit.close().await;
    }
}

fn path_and_query(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}
