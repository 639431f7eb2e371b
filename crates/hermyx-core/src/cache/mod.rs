//! Response caching.
//!
//! Three backends sit behind the [`CacheStore`] trait:
//!
//! - [`MemoryCache`]: bounded LRU with per-entry TTL, single mutex.
//! - [`DiskCache`]: persistent append-only memory-mapped log with an
//!   in-memory index; survives restarts.
//! - [`RedisCache`]: namespaced keys in a shared Redis, one instance's cache
//!   visible to every proxy pointing at it.
//!
//! Exactly one backend is active per process, selected by the global cache
//! config. [`CacheManager`] wraps the active store with policy resolution
//! and fingerprint construction.

mod disk;
mod manager;
mod memory;
pub(crate) mod redis;

pub use disk::DiskCache;
pub use manager::{fingerprint, CacheKeyPolicy, CacheManager, CachePolicy};
pub use memory::MemoryCache;
pub use redis::RedisCache;

use crate::config::{CacheBackendKind, CacheConfig};
use async_trait::async_trait;
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;

/// Errors surfaced by cache backends.
///
/// The request pipeline treats read errors as cache misses and write errors
/// as droppable, so none of these ever fail a request.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache store is closed")]
    Closed,

    #[error("corrupted cache record: {0}")]
    Corrupted(&'static str),

    #[error("cache capacity must be greater than zero")]
    InvalidCapacity,

    #[error("redis cache error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("redis backend selected but no redis configuration block was provided")]
    MissingRedisConfig,
}

/// Storage interface shared by every cache backend.
///
/// `ttl` semantics are backend-defined only in how "no expiry" is encoded;
/// a positive `ttl` always bounds the entry's lifetime.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stores `value` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Returns the live entry for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Removes `key` if present.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Releases backend resources. Idempotent.
    async fn close(&self) -> Result<(), CacheError>;
}

/// Builds the configured cache backend.
///
/// `storage_path` is where the disk backend keeps its log file.
///
/// # Errors
///
/// Returns an error when the capacity is zero, the disk file cannot be
/// opened or scanned, or the Redis backend is selected without its config
/// block.
pub async fn build_store(
    config: &CacheConfig,
    storage_path: &Path,
) -> Result<Arc<dyn CacheStore>, CacheError> {
    let capacity = config.capacity.unwrap_or(0);

    match config.backend.unwrap_or(CacheBackendKind::Memory) {
        CacheBackendKind::Memory => Ok(Arc::new(MemoryCache::new(capacity)?)),
        CacheBackendKind::Disk => Ok(Arc::new(DiskCache::open(storage_path, capacity)?)),
        CacheBackendKind::Redis => {
            let redis = config.redis.as_ref().ok_or(CacheError::MissingRedisConfig)?;
            Ok(Arc::new(RedisCache::new(redis)?))
        }
    }
}
