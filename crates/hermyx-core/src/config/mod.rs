//! Application configuration.
//!
//! Hermyx is configured from a single YAML file with camelCase keys:
//!
//! ```yaml
//! server:
//!   port: 8080
//! cache:
//!   enabled: true
//!   type: memory
//!   ttl: 5m
//!   capacity: 1000
//!   maxContentSize: 1048576
//!   keyConfig:
//!     type: [path, query]
//! routes:
//!   - name: users
//!     path: "^/api/users"
//!     target: "localhost:3000"
//! ```
//!
//! Loading is a three-step process:
//!
//! 1. [`HermyxConfig::load`] reads and parses the file.
//! 2. [`HermyxConfig::apply_defaults`] fills every missing global value the
//!    way a fresh deployment expects: a free port when none is configured, a
//!    storage directory derived from the config path, cache sizing defaults,
//!    and the rate-limit defaults (100 req / 1 min, status 429, key by IP).
//! 3. [`HermyxConfig::validate`] rejects fatal misconfiguration — a Redis
//!    backend selected without a Redis block, a zero cache capacity — before
//!    any listener is bound.
//!
//! Per-route `cache` and `rateLimit` blocks are overrides; the resolution
//! rules that merge them with the globals live with the subsystems
//! ([`crate::cache::CachePolicy::resolve`],
//! [`crate::ratelimit::RateLimitPolicy::resolve`]).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    net::TcpListener,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

/// Default cache TTL applied when the global block leaves it unset.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// Default global cache capacity in entries.
pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;
/// Default per-entry size ceiling in bytes (1 MiB).
pub const DEFAULT_MAX_CONTENT_SIZE: u64 = 1024 * 1024;

/// Errors raised while loading, defaulting, validating, or writing
/// configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unable to serialize configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("unable to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{backend} backend selected but no redis configuration block was provided")]
    MissingRedisBlock { backend: &'static str },

    #[error("cache capacity must be greater than zero")]
    ZeroCapacity,

    #[error("route {route:?} has no upstream target")]
    MissingTarget { route: String },

    #[error("invalid pattern {pattern:?} in route {route:?}: {source}")]
    InvalidRoutePattern {
        route: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("could not determine the user application-data directory")]
    NoAppDataDir,

    #[error("unable to create storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage path has not been resolved; call apply_defaults first")]
    StorageUnresolved,

    #[error("unable to select a free port: {0}")]
    PortProbe(#[source] std::io::Error),
}

/// Logging sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Append log lines to a file under the storage directory.
    pub to_file: bool,

    /// Log file path; required when `toFile` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,

    /// Mirror log lines to stdout.
    pub to_stdout: bool,

    /// Lift the level filter from `info` to `debug`.
    pub debug_enabled: bool,

    /// Output format: `"pretty"` or `"json"`.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            to_file: false,
            file_path: None,
            to_stdout: true,
            debug_enabled: false,
            format: "pretty".to_string(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Port to listen on. `0` auto-selects a free port at startup.
    pub port: u16,

    /// Optional request-level timeout for upstream dispatch. Absent means no
    /// timeout beyond what the operating system imposes.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub upstream_timeout: Option<Duration>,
}

/// On-disk state location (PID file, disk cache file).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Storage directory. Defaults to
    /// `<user-app-data>/hermyx/<hash(abs-config-path)>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Cache backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Disk,
    Redis,
}

/// Rate-limit backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackendKind {
    Memory,
    Redis,
}

/// A component of the cache fingerprint.
///
/// Variants are declared in alphabetical order so the derived `Ord` matches
/// the lexicographic ordering used to normalize key policies: fingerprints
/// must not depend on the order components were declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyComponent {
    Header,
    Method,
    Path,
    Query,
}

/// A single header participating in the cache fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderCacheKey {
    pub key: String,
}

/// Declarative cache key policy: which request parts make up the
/// fingerprint, and which HTTP methods bypass the cache entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheKeyConfig {
    #[serde(rename = "type")]
    pub components: Vec<KeyComponent>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_methods: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderCacheKey>,
}

/// Connection settings shared by the Redis cache and rate-limit backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// `host:port` of the Redis server.
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<i64>,

    /// Fallback TTL for cache entries stored without an explicit one.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<Duration>,

    /// Key prefix. The cache defaults to `hermyx:`, the rate limiter to
    /// `hermyx:ratelimit:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Rate limiting only: allow requests through when Redis is unreachable
    /// (`true`, the default) or deny them (`false`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_open: Option<bool>,
}

/// Cache configuration. The same shape serves as the global block and as a
/// per-route override; in route position, unset fields inherit from the
/// global block, while `capacity`, `type`, and `redis` are global-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub enabled: bool,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub backend: Option<CacheBackendKind>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_content_size: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_config: Option<CacheKeyConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

/// Which rate-limit headers to emit on responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitHeadersConfig {
    pub include_remaining: bool,
    pub include_reset: bool,
    pub include_limit: bool,
}

/// Rate-limit configuration. Like [`CacheConfig`], this doubles as the
/// global block and the per-route override; `storage` and `redis` are
/// global-only and cannot be overridden per route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<i64>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub window: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<RateLimitBackendKind>,

    /// Ordered key components: `ip`, `header:NAME`, or a verbatim token.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key_by: Vec<String>,

    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub block_duration: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<RateLimitHeadersConfig>,
}

impl RateLimitConfig {
    /// Fills missing fields with the stock defaults: 100 requests per one
    /// minute window, one minute block duration, status 429, memory storage,
    /// key by IP, and a plain denial message.
    pub fn apply_defaults(&mut self) {
        self.requests.get_or_insert(100);
        self.window.get_or_insert(Duration::from_secs(60));
        self.block_duration.get_or_insert(Duration::from_secs(60));
        self.status_code.get_or_insert(429);
        self.storage.get_or_insert(RateLimitBackendKind::Memory);
        if self.key_by.is_empty() {
            self.key_by.push("ip".to_string());
        }
        if self.message.as_deref().map_or(true, str::is_empty) {
            self.message = Some("Rate limit exceeded".to_string());
        }
    }
}

/// A declarative route: a path regex bound to an upstream target, with
/// optional include/exclude filters and cache / rate-limit overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteConfig {
    pub name: String,

    /// Regex matched against the request path.
    pub path: String,

    /// Upstream target as `host:port`; `http://` / `https://` prefixes are
    /// stripped at dispatch time.
    pub target: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
}

/// Root configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HermyxConfig {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    pub routes: Vec<RouteConfig>,
}

impl HermyxConfig {
    /// Reads and parses the YAML config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid YAML for this schema.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        serde_yaml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Fills every missing global value with its default.
    ///
    /// `config_path` is used to derive the storage directory when none is
    /// configured, so that two configs never collide on PID or cache files.
    ///
    /// # Errors
    ///
    /// Returns an error if a free port cannot be probed or the derived
    /// storage directory cannot be created.
    pub fn apply_defaults(&mut self, config_path: &Path) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            let port = free_port()?;
            warn!(port, "server port not specified, assigned a free port");
            self.server.port = port;
        }

        if self.cache.capacity.unwrap_or(0) == 0 {
            warn!(
                capacity = DEFAULT_CACHE_CAPACITY,
                "global cache capacity not specified, using default"
            );
            self.cache.capacity = Some(DEFAULT_CACHE_CAPACITY);
        }
        if self.cache.ttl.unwrap_or(Duration::ZERO).is_zero() {
            warn!(ttl_secs = DEFAULT_CACHE_TTL.as_secs(), "global cache ttl not specified, using default");
            self.cache.ttl = Some(DEFAULT_CACHE_TTL);
        }
        if self.cache.max_content_size.unwrap_or(0) == 0 {
            warn!(
                bytes = DEFAULT_MAX_CONTENT_SIZE,
                "global cache max content size not specified, using default"
            );
            self.cache.max_content_size = Some(DEFAULT_MAX_CONTENT_SIZE);
        }
        if self.cache.backend.is_none() {
            warn!("global cache type not specified, using the memory cache");
            self.cache.backend = Some(CacheBackendKind::Memory);
        }

        if self.storage.path.is_none() {
            let dir = default_storage_dir(config_path)?;
            info!(path = %dir.display(), "storage path not specified, using derived default");
            self.storage.path = Some(dir);
        }

        let rate_limit = self.rate_limit.get_or_insert_with(RateLimitConfig::default);
        rate_limit.apply_defaults();

        Ok(())
    }

    /// Rejects configurations that cannot produce a working process.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::MissingRedisBlock`] when a Redis backend is selected
    ///   without its connection block.
    /// - [`ConfigError::ZeroCapacity`] when the cache capacity is zero.
    /// - [`ConfigError::MissingTarget`] when a route has no upstream target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.backend == Some(CacheBackendKind::Redis) && self.cache.redis.is_none() {
            return Err(ConfigError::MissingRedisBlock { backend: "cache" });
        }

        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.enabled
                && rate_limit.storage == Some(RateLimitBackendKind::Redis)
                && rate_limit.redis.is_none()
            {
                return Err(ConfigError::MissingRedisBlock { backend: "rate-limit" });
            }
        }

        if self.cache.capacity == Some(0) {
            return Err(ConfigError::ZeroCapacity);
        }

        for route in &self.routes {
            if route.target.is_empty() {
                return Err(ConfigError::MissingTarget { route: route.name.clone() });
            }
        }

        Ok(())
    }

    /// Returns the resolved storage directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::StorageUnresolved`] if called before
    /// [`apply_defaults`](Self::apply_defaults) on a config without an
    /// explicit storage path.
    pub fn storage_path(&self) -> Result<&Path, ConfigError> {
        self.storage.path.as_deref().ok_or(ConfigError::StorageUnresolved)
    }

    /// Serializes the configuration to YAML and writes it to `path`,
    /// creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem operation fails.
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;
            }
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    /// Builds the fully-populated scaffold written by `hermyx init`: file and
    /// stdout logging into the derived storage directory, a free port, a
    /// memory cache with standard sizing, and one example route.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directory cannot be derived or no
    /// free port is available.
    pub fn default_scaffold(config_path: &Path) -> Result<Self, ConfigError> {
        let storage_dir = default_storage_dir(config_path)?;
        let port = free_port()?;

        Ok(Self {
            log: LogConfig {
                to_file: true,
                file_path: Some(storage_dir.join("hermyx.log")),
                to_stdout: true,
                debug_enabled: false,
                format: "pretty".to_string(),
            },
            server: ServerConfig { port, upstream_timeout: None },
            storage: StorageConfig { path: Some(storage_dir) },
            cache: CacheConfig {
                enabled: true,
                backend: Some(CacheBackendKind::Memory),
                ttl: Some(Duration::from_secs(300)),
                capacity: Some(DEFAULT_CACHE_CAPACITY),
                max_content_size: Some(DEFAULT_MAX_CONTENT_SIZE),
                key_config: Some(CacheKeyConfig {
                    components: vec![
                        KeyComponent::Path,
                        KeyComponent::Method,
                        KeyComponent::Query,
                        KeyComponent::Header,
                    ],
                    exclude_methods: vec!["post".to_string(), "put".to_string()],
                    headers: vec![HeaderCacheKey { key: "x-device-id".to_string() }],
                }),
                redis: None,
            },
            rate_limit: None,
            routes: vec![RouteConfig {
                name: "example-route".to_string(),
                path: "^/api/example".to_string(),
                target: "localhost:3000".to_string(),
                include: vec![".*".to_string()],
                exclude: vec![],
                cache: Some(CacheConfig {
                    enabled: true,
                    ttl: Some(Duration::from_secs(120)),
                    key_config: Some(CacheKeyConfig {
                        components: vec![KeyComponent::Path, KeyComponent::Query],
                        exclude_methods: vec!["post".to_string()],
                        headers: vec![],
                    }),
                    ..CacheConfig::default()
                }),
                rate_limit: None,
            }],
        })
    }
}

/// Derives the default storage directory for a config file:
/// `<user-app-data>/hermyx/<hex-hash(abs-config-path)>`. The directory is
/// created if it does not exist.
///
/// # Errors
///
/// Returns an error if the platform app-data directory cannot be determined
/// or the directory cannot be created.
pub fn default_storage_dir(config_path: &Path) -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir().ok_or(ConfigError::NoAppDataDir)?;
    let abs = config_path
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default().join(config_path));

    let digest = Sha256::digest(abs.to_string_lossy().as_bytes());
    let mut tag = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        tag.push_str(&format!("{byte:02x}"));
    }

    let dir = base.join("hermyx").join(tag);
    std::fs::create_dir_all(&dir)
        .map_err(|source| ConfigError::Storage { path: dir.clone(), source })?;
    Ok(dir)
}

/// Asks the kernel for a currently-free TCP port.
///
/// # Errors
///
/// Returns [`ConfigError::PortProbe`] if no port can be bound.
pub fn free_port() -> Result<u16, ConfigError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(ConfigError::PortProbe)?;
    let addr = listener.local_addr().map_err(ConfigError::PortProbe)?;
    Ok(addr.port())
}
