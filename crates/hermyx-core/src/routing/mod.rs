//! Route compilation and matching.
//!
//! Routes are compiled once at startup — path regex, combined
//! include/exclude regexes, and the effective cache and rate-limit policies
//! resolved against the globals — and are immutable afterwards, so the
//! request path reads them without locks.
//!
//! Matching proceeds in declared order and the first hit wins. Two variants
//! share the path/include/exclude core:
//!
//! - the **cache** matcher also consults the route's excluded methods: an
//!   excluded method reports "no match", sending the request down the
//!   fallback-proxy path rather than to the route's target;
//! - the **rate-limit** matcher ignores method exclusions entirely, so rate
//!   limits apply independently of cache method skipping.

use crate::{
    cache::CachePolicy,
    config::{ConfigError, HermyxConfig, RouteConfig},
    ratelimit::RateLimitPolicy,
};
use regex::Regex;
use tracing::debug;

/// One route after startup compilation.
#[derive(Debug)]
pub struct CompiledRoute {
    pub name: String,
    pub target: String,
    path: Regex,
    include: Option<Regex>,
    exclude: Option<Regex>,
    pub cache: CachePolicy,
    pub rate_limit: RateLimitPolicy,
}

impl CompiledRoute {
    fn matches_path(&self, path: &str) -> bool {
        if !self.path.is_match(path) {
            return false;
        }
        if let Some(include) = &self.include {
            if !include.is_match(path) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(path) {
                return false;
            }
        }
        true
    }
}

/// The compiled, ordered route list.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// Compiles every configured route against the global config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRoutePattern`] for any regex that does
    /// not compile.
    pub fn compile(config: &HermyxConfig) -> Result<Self, ConfigError> {
        let global_rate_limit = config.rate_limit.clone().unwrap_or_default();

        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            routes.push(Self::compile_route(route, config, &global_rate_limit)?);
        }

        Ok(Self { routes })
    }

    fn compile_route(
        route: &RouteConfig,
        config: &HermyxConfig,
        global_rate_limit: &crate::config::RateLimitConfig,
    ) -> Result<CompiledRoute, ConfigError> {
        let path = Regex::new(&route.path).map_err(|source| ConfigError::InvalidRoutePattern {
            route: route.name.clone(),
            pattern: route.path.clone(),
            source,
        })?;

        let include = if route.include.is_empty() {
            None
        } else {
            Some(combine_patterns(&route.include).map_err(|source| {
                ConfigError::InvalidRoutePattern {
                    route: route.name.clone(),
                    pattern: route.include.join(", "),
                    source,
                }
            })?)
        };

        let exclude = if route.exclude.is_empty() {
            None
        } else {
            Some(combine_patterns(&route.exclude).map_err(|source| {
                ConfigError::InvalidRoutePattern {
                    route: route.name.clone(),
                    pattern: route.exclude.join(", "),
                    source,
                }
            })?)
        };

        Ok(CompiledRoute {
            name: route.name.clone(),
            target: route.target.clone(),
            path,
            include,
            exclude,
            cache: CachePolicy::resolve(&config.cache, route.cache.as_ref()),
            rate_limit: RateLimitPolicy::resolve(global_rate_limit, route.rate_limit.as_ref()),
        })
    }

    /// Selects the route for the cache/dispatch path.
    ///
    /// `method` must already be lower-cased. When the first route whose
    /// filters match excludes the method, the whole lookup reports "no
    /// match" and the request falls through to the fallback proxy.
    pub fn match_for_cache(&self, path: &str, method: &str) -> Option<&CompiledRoute> {
        for route in &self.routes {
            if !route.matches_path(path) {
                continue;
            }

            if let Some(key) = &route.cache.key {
                if key.excludes_method(method) {
                    debug!(route = %route.name, method, "method excluded, treating as unmatched");
                    return None;
                }
            }

            return Some(route);
        }
        None
    }

    /// Selects the route for the rate-limit pre-hook. Method exclusion lists
    /// are ignored here.
    pub fn match_for_rate_limit(&self, path: &str) -> Option<&CompiledRoute> {
        self.routes.iter().find(|route| route.matches_path(path))
    }

    /// Upstream targets of every compiled route, for eager client-pool
    /// construction.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.target.as_str())
    }

    /// Number of compiled routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` when no routes are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// ORs several regex sources into one pattern, each wrapped non-capturingly:
/// `(?:a)|(?:b)`.
pub fn combine_patterns(patterns: &[String]) -> Result<Regex, regex::Error> {
    let combined = patterns
        .iter()
        .map(|p| format!("(?:{p})"))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&combined)
}
