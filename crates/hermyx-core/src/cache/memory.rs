//! In-memory LRU+TTL cache backend.

use super::{CacheError, CacheStore};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::{num::NonZeroUsize, time::Duration};
use tokio::time::Instant;

struct MemoryEntry {
    value: Vec<u8>,
    /// `None` means the entry never expires (TTL too large to represent).
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Bounded in-memory cache with LRU eviction and lazy TTL expiry.
///
/// All operations serialize on a single mutex. Insertion at capacity evicts
/// the least-recently-used entry; expired entries are removed when a lookup
/// observes them.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryCache {
    /// Creates a cache bounded to `capacity` entries.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidCapacity`] when `capacity` is zero.
    pub fn new(capacity: u64) -> Result<Self, CacheError> {
        let capacity = usize::try_from(capacity)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(CacheError::InvalidCapacity)?;
        Ok(Self { entries: Mutex::new(LruCache::new(capacity)) })
    }

    /// Number of live entries (expired-but-unobserved entries included).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries.lock().push(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.expired(now),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
            return Ok(None);
        }

        // Promotes the entry to most-recently-used.
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().pop(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(MemoryCache::new(0), Err(CacheError::InvalidCapacity)));
    }

    #[tokio::test]
    async fn round_trip() {
        let cache = MemoryCache::new(10).unwrap();

        cache.set("k", b"v".to_vec(), TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn overwrite_replaces_value() {
        let cache = MemoryCache::new(10).unwrap();

        cache.set("k", b"old".to_vec(), TTL).await.unwrap();
        cache.set("k", b"new".to_vec(), TTL).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(b"new".to_vec()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let cache = MemoryCache::new(3).unwrap();

        for i in 0..10 {
            cache.set(&format!("k{i}"), vec![i], TTL).await.unwrap();
            assert!(cache.len() <= 3);
        }

        // The three most recent survive, the rest were evicted.
        assert_eq!(cache.get("k9").await.unwrap(), Some(vec![9]));
        assert_eq!(cache.get("k0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lru_eviction_prefers_stale_entries() {
        let cache = MemoryCache::new(2).unwrap();

        cache.set("a", b"a".to_vec(), TTL).await.unwrap();
        cache.set("b", b"b".to_vec(), TTL).await.unwrap();

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").await.unwrap().is_some());
        cache.set("c", b"c".to_vec(), TTL).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_removed_on_lookup() {
        let cache = MemoryCache::new(10).unwrap();

        cache.set("k", b"v".to_vec(), Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_survives_until_ttl() {
        let cache = MemoryCache::new(10).unwrap();

        cache.set("k", b"v".to_vec(), Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let cache = MemoryCache::new(10).unwrap();

        cache.set("k", b"v".to_vec(), TTL).await.unwrap();
        cache.delete("k").await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn distinct_keys_are_isolated() {
        let cache = MemoryCache::new(10).unwrap();

        cache.set("a", b"1".to_vec(), TTL).await.unwrap();
        cache.set("b", b"2".to_vec(), TTL).await.unwrap();
        cache.delete("a").await.unwrap();

        assert_eq!(cache.get("b").await.unwrap(), Some(b"2".to_vec()));
    }
}
