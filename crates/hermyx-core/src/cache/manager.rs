//! Cache policy resolution, fingerprint construction, and the store facade.

use super::{CacheError, CacheStore};
use crate::config::{CacheConfig, CacheKeyConfig, KeyComponent};
use http::HeaderMap;
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::config::{DEFAULT_CACHE_TTL, DEFAULT_MAX_CONTENT_SIZE};

/// Effective cache key policy after resolution: components sorted for
/// fingerprint stability, method exclusions lower-cased for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyPolicy {
    pub components: Vec<KeyComponent>,
    pub exclude_methods: Vec<String>,
    /// Header names contributing to the fingerprint, in declared order.
    pub headers: Vec<String>,
}

impl CacheKeyPolicy {
    fn from_config(config: &CacheKeyConfig) -> Self {
        let mut components = config.components.clone();
        components.sort();

        Self {
            components,
            exclude_methods: config
                .exclude_methods
                .iter()
                .map(|m| m.to_lowercase())
                .collect(),
            headers: config.headers.iter().map(|h| h.key.clone()).collect(),
        }
    }

    /// Whether the (already lower-cased) method bypasses the cache — and,
    /// under the legacy matcher coupling, routing for this route.
    pub fn excludes_method(&self, method: &str) -> bool {
        self.exclude_methods.iter().any(|m| m == method)
    }
}

/// Effective cache policy for one route, computed once at startup.
///
/// Capacity and backend selection are deliberately absent: those are
/// global-only and live with the store itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_content_size: u64,
    pub key: Option<CacheKeyPolicy>,
}

impl CachePolicy {
    /// Merges a route-level override over the global cache config.
    ///
    /// Rules: a missing route block means the global policy applies
    /// wholesale; a disabled route block disables caching outright; an
    /// enabled one keeps its own values and inherits TTL, key policy, and
    /// max content size from the global block where unset. The component
    /// list is sorted afterwards so fingerprints do not depend on
    /// declaration order.
    pub fn resolve(global: &CacheConfig, route: Option<&CacheConfig>) -> Self {
        let source = route.unwrap_or(global);

        if route.is_some() && !source.enabled {
            return Self {
                enabled: false,
                ttl: Duration::ZERO,
                max_content_size: 0,
                key: source.key_config.as_ref().map(CacheKeyPolicy::from_config),
            };
        }

        let ttl = source
            .ttl
            .filter(|ttl| !ttl.is_zero())
            .or(global.ttl)
            .unwrap_or(DEFAULT_CACHE_TTL);
        let max_content_size = source
            .max_content_size
            .filter(|&size| size > 0)
            .or(global.max_content_size)
            .unwrap_or(DEFAULT_MAX_CONTENT_SIZE);
        let key = source
            .key_config
            .as_ref()
            .or(global.key_config.as_ref())
            .map(CacheKeyPolicy::from_config);

        Self { enabled: source.enabled, ttl, max_content_size, key }
    }
}

/// Builds the cache fingerprint for a request under the given key policy.
///
/// Components are joined with `|` in the policy's (sorted) order. The
/// `header` component contributes one part per declared header, in declared
/// order, empty when absent. No hashing is applied; stores hash internally
/// if they need to.
pub fn fingerprint(
    key: &CacheKeyPolicy,
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(key.components.len() + key.headers.len());

    for component in &key.components {
        match component {
            KeyComponent::Method => parts.push(method.to_lowercase()),
            KeyComponent::Path => parts.push(path.to_string()),
            KeyComponent::Query => parts.push(query.to_string()),
            KeyComponent::Header => {
                for name in &key.headers {
                    let value = headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default();
                    parts.push(value.to_string());
                }
            }
        }
    }

    parts.join("|")
}

/// Facade over the active cache store.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
}

impl CacheManager {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Stores `value` under `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error; callers on the response path log and
    /// drop it.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        debug!(key, ttl_secs = ttl.as_secs(), bytes = value.len(), "cache set");
        self.store.set(key, value, ttl).await
    }

    /// Looks up `key`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error; callers on the request path treat it as
    /// a miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.store.get(key).await
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(key).await
    }

    /// Closes the underlying store.
    ///
    /// # Errors
    ///
    /// Propagates the backend error.
    pub async fn close(&self) -> Result<(), CacheError> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeaderCacheKey, RedisConfig};

    fn key_config(components: Vec<KeyComponent>) -> CacheKeyConfig {
        CacheKeyConfig { components, exclude_methods: vec![], headers: vec![] }
    }

    fn global() -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl: Some(Duration::from_secs(300)),
            capacity: Some(1000),
            max_content_size: Some(1024),
            key_config: Some(key_config(vec![KeyComponent::Path])),
            ..CacheConfig::default()
        }
    }

    #[test]
    fn missing_route_block_uses_global() {
        let policy = CachePolicy::resolve(&global(), None);

        assert!(policy.enabled);
        assert_eq!(policy.ttl, Duration::from_secs(300));
        assert_eq!(policy.max_content_size, 1024);
        assert_eq!(policy.key.unwrap().components, vec![KeyComponent::Path]);
    }

    #[test]
    fn disabled_route_block_wins() {
        let route = CacheConfig { enabled: false, ..CacheConfig::default() };
        let policy = CachePolicy::resolve(&global(), Some(&route));
        assert!(!policy.enabled);
    }

    #[test]
    fn route_inherits_unset_scalars_from_global() {
        let route = CacheConfig { enabled: true, ..CacheConfig::default() };
        let policy = CachePolicy::resolve(&global(), Some(&route));

        assert_eq!(policy.ttl, Duration::from_secs(300));
        assert_eq!(policy.max_content_size, 1024);
        assert_eq!(policy.key.unwrap().components, vec![KeyComponent::Path]);
    }

    #[test]
    fn route_overrides_win_over_global() {
        let route = CacheConfig {
            enabled: true,
            ttl: Some(Duration::from_secs(30)),
            max_content_size: Some(64),
            key_config: Some(key_config(vec![KeyComponent::Query, KeyComponent::Method])),
            ..CacheConfig::default()
        };
        let policy = CachePolicy::resolve(&global(), Some(&route));

        assert_eq!(policy.ttl, Duration::from_secs(30));
        assert_eq!(policy.max_content_size, 64);
        assert_eq!(
            policy.key.unwrap().components,
            vec![KeyComponent::Method, KeyComponent::Query]
        );
    }

    #[test]
    fn zero_ttl_in_route_inherits_global() {
        let route = CacheConfig {
            enabled: true,
            ttl: Some(Duration::ZERO),
            ..CacheConfig::default()
        };
        let policy = CachePolicy::resolve(&global(), Some(&route));
        assert_eq!(policy.ttl, Duration::from_secs(300));
    }

    #[test]
    fn capacity_and_backend_are_not_part_of_the_policy() {
        // Redis block and capacity in a route override are ignored; only
        // enabled/ttl/key/max-content-size participate.
        let route = CacheConfig {
            enabled: true,
            capacity: Some(5),
            redis: Some(RedisConfig {
                address: "127.0.0.1:6379".to_string(),
                password: String::new(),
                db: None,
                default_ttl: None,
                namespace: None,
                fail_open: None,
            }),
            ..CacheConfig::default()
        };
        let policy = CachePolicy::resolve(&global(), Some(&route));
        assert_eq!(policy.ttl, Duration::from_secs(300));
    }

    #[test]
    fn exclude_methods_are_lowercased() {
        let config = CacheKeyConfig {
            components: vec![KeyComponent::Path],
            exclude_methods: vec!["POST".to_string(), "Put".to_string()],
            headers: vec![],
        };
        let policy = CacheKeyPolicy::from_config(&config);

        assert!(policy.excludes_method("post"));
        assert!(policy.excludes_method("put"));
        assert!(!policy.excludes_method("get"));
    }

    #[test]
    fn fingerprint_is_stable_across_declared_order() {
        let a = CachePolicy::resolve(
            &CacheConfig {
                enabled: true,
                key_config: Some(key_config(vec![KeyComponent::Path, KeyComponent::Query])),
                ..CacheConfig::default()
            },
            None,
        );
        let b = CachePolicy::resolve(
            &CacheConfig {
                enabled: true,
                key_config: Some(key_config(vec![KeyComponent::Query, KeyComponent::Path])),
                ..CacheConfig::default()
            },
            None,
        );

        let headers = HeaderMap::new();
        let fa = fingerprint(&a.key.unwrap(), "get", "/api/users", "x=1", &headers);
        let fb = fingerprint(&b.key.unwrap(), "get", "/api/users", "x=1", &headers);

        assert_eq!(fa, fb);
        assert_eq!(fa, "/api/users|x=1");
    }

    #[test]
    fn fingerprint_includes_declared_headers_in_order() {
        let config = CacheKeyConfig {
            components: vec![KeyComponent::Header, KeyComponent::Method],
            exclude_methods: vec![],
            headers: vec![
                HeaderCacheKey { key: "x-device-id".to_string() },
                HeaderCacheKey { key: "x-tenant".to_string() },
            ],
        };
        let policy = CacheKeyPolicy::from_config(&config);

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());

        // Absent header contributes an empty part.
        assert_eq!(fingerprint(&policy, "GET", "/x", "", &headers), "|acme|get");
    }

    #[test]
    fn fingerprint_lowercases_method_only() {
        let policy = CacheKeyPolicy::from_config(&key_config(vec![
            KeyComponent::Method,
            KeyComponent::Path,
        ]));
        let headers = HeaderMap::new();

        assert_eq!(fingerprint(&policy, "GET", "/CaseSensitive", "", &headers), "get|/CaseSensitive");
    }
}
