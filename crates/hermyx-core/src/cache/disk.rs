//! Persistent disk cache backend.
//!
//! Entries live in a single append-only file, `hermyx.cache`, inside the
//! storage directory. The file is memory-mapped read/write; an in-memory
//! index maps each key to the offset of its most recent record and doubles
//! as the LRU recency list. Records are never rewritten in place: overwrites
//! and deletes only touch the index, so dead bytes accumulate until the file
//! is recreated. There is no compaction.
//!
//! Record layout (big-endian):
//!
//! ```text
//! [keyLen: u32][key: keyLen bytes][expiry: u64 ns since epoch, 0 = never]
//! [valueLen: u32][value: valueLen bytes]
//! ```
//!
//! On startup the file is scanned sequentially to rebuild the index; records
//! whose expiry has passed are skipped, and the write cursor resumes at the
//! end of the last live record.

use super::{CacheError, CacheStore};
use async_trait::async_trait;
use lru::LruCache;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

const CACHE_FILE_NAME: &str = "hermyx.cache";
const INITIAL_FILE_SIZE: u64 = 1 << 20;

/// Fixed bytes per record in addition to key and value: keyLen + expiry +
/// valueLen.
const RECORD_OVERHEAD: u64 = 4 + 8 + 4;

struct MappedFile {
    file: File,
    map: MmapMut,
}

struct DiskInner {
    /// `None` once the cache has been closed.
    mapped: Option<MappedFile>,
    /// Key -> record start offset, in LRU order (least recent evicted
    /// first). Also enforces the entry-count capacity.
    index: LruCache<String, u64>,
    write_cursor: u64,
}

/// Memory-mapped append-log cache. All operations serialize on one mutex.
pub struct DiskCache {
    inner: Mutex<DiskInner>,
}

/// A record parsed out of the mapped file.
struct Record<'a> {
    key: &'a [u8],
    expiry_ns: u64,
    value: &'a [u8],
    end: u64,
}

fn read_u32(data: &[u8], offset: u64) -> Option<u32> {
    let start = usize::try_from(offset).ok()?;
    let bytes = data.get(start..start + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], offset: u64) -> Option<u64> {
    let start = usize::try_from(offset).ok()?;
    let bytes: [u8; 8] = data.get(start..start + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn parse_record(data: &[u8], offset: u64) -> Option<Record<'_>> {
    let key_len = u64::from(read_u32(data, offset)?);
    if key_len == 0 {
        return None;
    }
    let key_start = offset + 4;
    let key = data.get(usize::try_from(key_start).ok()?..usize::try_from(key_start + key_len).ok()?)?;

    let expiry_ns = read_u64(data, key_start + key_len)?;
    let value_len = u64::from(read_u32(data, key_start + key_len + 8)?);
    let value_start = key_start + key_len + 8 + 4;
    let value = data
        .get(usize::try_from(value_start).ok()?..usize::try_from(value_start + value_len).ok()?)?;

    Some(Record { key, expiry_ns, value, end: value_start + value_len })
}

fn now_unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

impl DiskCache {
    /// Opens (or creates) the cache file under `storage_path` and rebuilds
    /// the index from its contents.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidCapacity`] when `capacity` is zero, or
    /// an I/O error if the file cannot be created, sized, or mapped.
    pub fn open(storage_path: &Path, capacity: u64) -> Result<Self, CacheError> {
        let capacity = usize::try_from(capacity)
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or(CacheError::InvalidCapacity)?;

        std::fs::create_dir_all(storage_path)?;
        let path = storage_path.join(CACHE_FILE_NAME);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if file.metadata()?.len() == 0 {
            file.set_len(INITIAL_FILE_SIZE)?;
        }

        // SAFETY: the file is owned by this process for the cache's lifetime
        // and every access to the mapping is serialized by `inner`'s mutex.
        let map = unsafe { MmapMut::map_mut(&file)? };

        let mut inner = DiskInner {
            mapped: Some(MappedFile { file, map }),
            index: LruCache::new(capacity),
            write_cursor: 0,
        };
        Self::load_index(&mut inner);

        debug!(
            path = %path.display(),
            entries = inner.index.len(),
            write_cursor = inner.write_cursor,
            "disk cache opened"
        );

        Ok(Self { inner: Mutex::new(inner) })
    }

    /// Sequentially scans the mapped file, indexing live records and
    /// skipping expired ones. The write cursor lands at the end of the last
    /// live record so expired tail bytes get overwritten.
    fn load_index(inner: &mut DiskInner) {
        let Some(mapped) = &inner.mapped else { return };
        let now = now_unix_ns();

        let mut offset = 0u64;
        while let Some(record) = parse_record(&mapped.map, offset) {
            let end = record.end;
            if record.expiry_ns != 0 && now > record.expiry_ns {
                offset = end;
                continue;
            }

            match std::str::from_utf8(record.key) {
                Ok(key) => {
                    inner.index.push(key.to_string(), offset);
                }
                Err(_) => {
                    warn!(offset, "skipping cache record with non-utf8 key");
                }
            }
            offset = end;
            inner.write_cursor = end;
        }
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Returns `true` when no entries are indexed.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().index.is_empty()
    }

    /// Unmaps, grows the file to at least `required` bytes (doubling to
    /// amortize), and remaps.
    fn expand(mapped: &mut MappedFile, required: u64) -> Result<(), CacheError> {
        let current = mapped.map.len() as u64;
        let new_size = required.max(current.saturating_mul(2));

        mapped.map.flush()?;
        mapped.file.set_len(new_size)?;
        // SAFETY: same ownership and serialization guarantees as in `open`.
        mapped.map = unsafe { MmapMut::map_mut(&mapped.file)? };
        Ok(())
    }
}

#[async_trait]
impl CacheStore for DiskCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();

        // Old bytes linger as dead space; only the index entry goes away.
        inner.index.pop(key);

        let expiry_ns = if ttl.is_zero() {
            0
        } else {
            now_unix_ns().saturating_add(u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX))
        };

        let record_len = RECORD_OVERHEAD + key.len() as u64 + value.len() as u64;
        let start = inner.write_cursor;
        let required = start + record_len;

        let mapped = inner.mapped.as_mut().ok_or(CacheError::Closed)?;
        if required > mapped.map.len() as u64 {
            Self::expand(mapped, required)?;
        }

        let mut cursor = usize::try_from(start).map_err(|_| CacheError::Corrupted("offset"))?;
        let data = &mut mapped.map[..];

        data[cursor..cursor + 4].copy_from_slice(&(key.len() as u32).to_be_bytes());
        cursor += 4;
        data[cursor..cursor + key.len()].copy_from_slice(key.as_bytes());
        cursor += key.len();
        data[cursor..cursor + 8].copy_from_slice(&expiry_ns.to_be_bytes());
        cursor += 8;
        data[cursor..cursor + 4].copy_from_slice(&(value.len() as u32).to_be_bytes());
        cursor += 4;
        data[cursor..cursor + value.len()].copy_from_slice(&value);

        // Pushing at capacity drops the least-recently-used key; its bytes
        // stay behind in the file.
        inner.index.push(key.to_string(), start);
        inner.write_cursor = required;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut inner = self.inner.lock();

        let Some(&offset) = inner.index.get(key) else {
            return Ok(None);
        };

        let mapped = inner.mapped.as_ref().ok_or(CacheError::Closed)?;
        let record =
            parse_record(&mapped.map, offset).ok_or(CacheError::Corrupted("record out of bounds"))?;

        if record.key != key.as_bytes() {
            return Err(CacheError::Corrupted("key mismatch at indexed offset"));
        }

        if record.expiry_ns != 0 && now_unix_ns() > record.expiry_ns {
            inner.index.pop(key);
            return Ok(None);
        }

        let value = record.value.to_vec();
        Ok(Some(value))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.lock().index.pop(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        if let Some(mapped) = inner.mapped.take() {
            mapped.map.flush()?;
            mapped.file.sync_all()?;
        }
        Ok(())
    }
}
