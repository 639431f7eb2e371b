//! Per-target upstream dispatch.
//!
//! Each distinct target gets one pooled, keep-alive [`reqwest::Client`] plus
//! a semaphore bounding in-flight requests to that target. Clients for
//! configured route targets are built eagerly at startup; fallback-proxy
//! hosts get theirs lazily through the concurrent map, so the hot path
//! never takes a global lock.

use super::ProxyError;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::debug;

/// Ceiling on concurrent in-flight requests per target.
const MAX_CONNS_PER_TARGET: usize = 10_000;

#[derive(Clone)]
struct UpstreamClient {
    http: reqwest::Client,
    permits: Arc<Semaphore>,
}

/// Cache of per-target HTTP clients.
pub struct UpstreamPool {
    clients: DashMap<String, UpstreamClient>,
    request_timeout: Option<Duration>,
}

/// Strips `http://` / `https://` prefixes from a configured target.
fn target_addr(target: &str) -> &str {
    target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
        .unwrap_or(target)
}

impl UpstreamPool {
    /// Creates an empty pool. `request_timeout` bounds each dispatched
    /// request end to end; `None` leaves requests unbounded.
    #[must_use]
    pub fn new(request_timeout: Option<Duration>) -> Self {
        Self { clients: DashMap::new(), request_timeout }
    }

    /// Eagerly builds clients for the given targets so route dispatch never
    /// pays first-use construction costs.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ClientBuild`] when a client cannot be built.
    pub fn prepare<'a>(
        &self,
        targets: impl Iterator<Item = &'a str>,
    ) -> Result<(), ProxyError> {
        for target in targets {
            let addr = target_addr(target);
            if !self.clients.contains_key(addr) {
                let client = self.build_client(addr)?;
                self.clients.insert(addr.to_string(), client);
            }
        }
        Ok(())
    }

    fn build_client(&self, addr: &str) -> Result<UpstreamClient, ProxyError> {
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none());

        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let http = builder.build().map_err(|e| ProxyError::ClientBuild {
            target: addr.to_string(),
            detail: e.to_string(),
        })?;

        debug!(target = addr, "upstream client created");
        Ok(UpstreamClient { http, permits: Arc::new(Semaphore::new(MAX_CONNS_PER_TARGET)) })
    }

    fn client_for(&self, addr: &str) -> Result<UpstreamClient, ProxyError> {
        if let Some(client) = self.clients.get(addr) {
            return Ok(client.clone());
        }
        let client = self.build_client(addr)?;
        Ok(self
            .clients
            .entry(addr.to_string())
            .or_insert(client)
            .clone())
    }

    /// Forwards a request to `target`, reusing that target's pooled
    /// connections, and buffers the full response.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Upstream`] on any transport failure — the
    /// pipeline turns it into a 502.
    pub async fn dispatch(
        &self,
        target: &str,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes), ProxyError> {
        let addr = target_addr(target);
        let client = self.client_for(addr)?;

        let _permit = client
            .permits
            .acquire()
            .await
            .map_err(|_| ProxyError::Upstream("upstream pool closed".to_string()))?;

        let url = format!("http://{addr}{path_and_query}");

        let mut forwarded = headers.clone();
        // Hop-by-hop and recomputed headers never cross the proxy.
        forwarded.remove(http::header::HOST);
        forwarded.remove(http::header::CONTENT_LENGTH);
        forwarded.remove(http::header::CONNECTION);
        forwarded.remove(http::header::TRANSFER_ENCODING);

        let response = client
            .http
            .request(method.clone(), &url)
            .headers(forwarded)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        response_headers.remove(http::header::CONNECTION);
        response_headers.remove(http::header::TRANSFER_ENCODING);
        response_headers.remove(http::header::CONTENT_LENGTH);

        let bytes = response.bytes().await?;

        Ok((status, response_headers, bytes))
    }

    /// Number of cached per-target clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns `true` when no clients have been built yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
