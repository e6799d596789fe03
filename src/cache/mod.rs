//! Bounded, concurrent response cache keyed by request fingerprint.
//!
//! Uses DashMap for sharded concurrent access, so lookups on unrelated keys
//! never serialize behind one another. Recency is tracked with a logical
//! clock per slot; once the configured capacity is exceeded, the least
//! recently used entries are evicted in batches of a tenth of capacity.
//!
//! Entries are immutable. A second `put` under a live fingerprint returns
//! the existing entry instead of replacing it.

pub mod singleflight;

use crate::config::CacheConfig;
use crate::error::Result;
use crate::fingerprint::{CanonicalRequest, Fingerprint};
use crate::request::{ModelResponse, ResponseChunk};
use crate::serialization::{decode_snapshot, encode_snapshot};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

pub use singleflight::{Flight, LeaderGuard, SingleFlight, Waiter};

const EVICTION_BATCH_DIVISOR: usize = 10;

/// Stored response payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub response: ModelResponse,
    /// Original chunk sequence when the response was streamed.
    pub chunks: Option<Vec<ResponseChunk>>,
}

impl CachedResponse {
    pub fn from_response(response: ModelResponse) -> Self {
        CachedResponse {
            response,
            chunks: None,
        }
    }

    /// Build from a streamed chunk sequence. `None` unless it was terminated.
    pub fn from_chunks(chunks: Vec<ResponseChunk>) -> Option<Self> {
        let response = ModelResponse::from_chunks(&chunks)?;
        Some(CachedResponse {
            response,
            chunks: Some(chunks),
        })
    }

    /// Chunks to replay: the recorded ones, or a synthesized sequence.
    pub fn replay_chunks(&self) -> Vec<ResponseChunk> {
        match &self.chunks {
            Some(chunks) => chunks.clone(),
            None => self.response.to_chunks(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.response.usage.total_tokens()
    }
}

/// One cache entry: fingerprint, payload, and the request that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub request: CanonicalRequest,
    pub payload: CachedResponse,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, request: CanonicalRequest, payload: CachedResponse) -> Self {
        CacheEntry {
            fingerprint,
            request,
            payload,
            created_at: Utc::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        let Some(ttl) = ttl else {
            return false;
        };
        // A negative age (clock skew) maps to Err and counts as fresh.
        (Utc::now() - self.created_at)
            .to_std()
            .is_ok_and(|age| age > ttl)
    }
}

struct Slot {
    entry: Arc<CacheEntry>,
    last_access: AtomicU64,
}

impl Slot {
    fn new(entry: Arc<CacheEntry>, tick: u64) -> Self {
        Slot {
            entry,
            last_access: AtomicU64::new(tick),
        }
    }
}

/// Thread-safe LRU response cache.
///
/// # Example
///
/// ```
/// use llm_cache_kit::cache::{CacheEntry, CachedResponse, ResponseCache};
/// use llm_cache_kit::config::CacheConfig;
/// use llm_cache_kit::fingerprint::{CanonicalRequest, Fingerprinter};
/// use llm_cache_kit::request::{InvocationRequest, Message, ModelResponse, Usage};
///
/// let cache = ResponseCache::new(CacheConfig::default().with_max_entries(2));
/// let request = InvocationRequest::new("gpt-4o").with_message(Message::user("hi"));
/// let key = Fingerprinter::new().fingerprint(&request);
///
/// cache.put(CacheEntry::new(
///     key,
///     CanonicalRequest::from_request(&request),
///     CachedResponse::from_response(ModelResponse::new("hello", Usage::new(3, 1))),
/// ));
/// assert!(cache.get(&key).is_some());
/// ```
pub struct ResponseCache {
    store: DashMap<Fingerprint, Slot>,
    clock: AtomicU64,
    max_entries: usize,
    ttl: Option<Duration>,
    eviction: Mutex<()>,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        ResponseCache {
            store: DashMap::new(),
            clock: AtomicU64::new(0),
            max_entries: config.max_entries.max(1),
            ttl: config.ttl,
            eviction: Mutex::new(()),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        match self.store.get(key) {
            Some(slot) if !slot.entry.is_expired(self.ttl) => {
                slot.last_access.store(self.tick(), Ordering::Relaxed);
                debug!("✓ ResponseCache GET {} -> HIT", key.short());
                return Some(Arc::clone(&slot.entry));
            }
            Some(_) => {}
            None => {
                debug!("✓ ResponseCache GET {} -> MISS", key.short());
                return None;
            }
        }

        // Expired: the read guard is released above before removing.
        if self
            .store
            .remove_if(key, |_, slot| slot.entry.is_expired(self.ttl))
            .is_some()
        {
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!("✓ ResponseCache GET {} -> EXPIRED", key.short());
        }
        None
    }

    /// Store an entry unless a live one already exists under its fingerprint.
    ///
    /// Returns the entry that is now in the cache, which is the pre-existing
    /// one if there was one.
    pub fn put(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let key = entry.fingerprint;
        let tick = self.tick();

        let stored = match self.store.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().entry.is_expired(self.ttl) {
                    debug!("✓ ResponseCache PUT {} -> kept existing", key.short());
                    return Arc::clone(&occupied.get().entry);
                }
                let entry = Arc::new(entry);
                occupied.insert(Slot::new(Arc::clone(&entry), tick));
                self.expirations.fetch_add(1, Ordering::Relaxed);
                entry
            }
            Entry::Vacant(vacant) => {
                let entry = Arc::new(entry);
                vacant.insert(Slot::new(Arc::clone(&entry), tick));
                entry
            }
        };
        debug!("✓ ResponseCache PUT {}", key.short());

        self.evict_overflow();
        stored
    }

    /// Remove an entry.
    pub fn remove(&self, key: &Fingerprint) -> bool {
        self.store.remove(key).is_some()
    }

    /// At most one put scans at a time; the others return at once and the
    /// scanning put rechecks the length after releasing the lock.
    fn evict_overflow(&self) {
        while self.store.len() > self.max_entries {
            let _guard = match self.eviction.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            self.evict_batch();
        }
    }

    /// One scan evicts the overflow or a tenth of capacity, whichever is
    /// larger, so a cache at capacity scans once per batch of puts.
    fn evict_batch(&self) {
        let overflow = self.store.len().saturating_sub(self.max_entries);
        if overflow == 0 {
            return;
        }
        let batch = overflow.max(self.max_entries / EVICTION_BATCH_DIVISOR);

        let mut victims: Vec<(u64, Fingerprint)> = self
            .store
            .iter()
            .map(|slot| (slot.last_access.load(Ordering::Relaxed), *slot.key()))
            .collect();
        if batch < victims.len() {
            victims.select_nth_unstable_by_key(batch, |(tick, _)| *tick);
            victims.truncate(batch);
        }

        for (_, key) in victims {
            if self.store.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("✓ ResponseCache EVICT {} (LRU)", key.short());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn clear(&self) {
        self.store.clear();
        warn!("⚠ ResponseCache CLEAR executed - all entries dropped");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_entries: self.store.len(),
            capacity: self.max_entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Encode every live entry, least recently used first.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if encoding fails.
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        let mut slots: Vec<(u64, Arc<CacheEntry>)> = self
            .store
            .iter()
            .filter(|slot| !slot.entry.is_expired(self.ttl))
            .map(|slot| (slot.last_access.load(Ordering::Relaxed), Arc::clone(&slot.entry)))
            .collect();
        slots.sort_by_key(|(tick, _)| *tick);

        let entries: Vec<&CacheEntry> = slots.iter().map(|(_, entry)| entry.as_ref()).collect();
        encode_snapshot(&entries)
    }

    /// Load entries from a snapshot produced by [`export_snapshot`].
    ///
    /// Existing entries win over snapshot entries with the same fingerprint.
    /// Returns the number of entries read from the snapshot.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidCacheEntry`: bad magic
    /// - `Error::VersionMismatch`: snapshot from another schema version
    /// - `Error::DeserializationError`: corrupted payload
    ///
    /// [`export_snapshot`]: ResponseCache::export_snapshot
    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<usize> {
        let entries: Vec<CacheEntry> = decode_snapshot(bytes)?;
        let count = entries.len();
        for entry in entries {
            if !entry.is_expired(self.ttl) {
                self.put(entry);
            }
        }
        info!("ResponseCache restored {} entries from snapshot", count);
        Ok(count)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.export_snapshot()?;
        std::fs::write(path.as_ref(), bytes)?;
        debug!("ResponseCache snapshot written to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let bytes = std::fs::read(path.as_ref())?;
        self.import_snapshot(&bytes)
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Cache statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fingerprint::Fingerprinter;
    use crate::request::{InvocationRequest, Message, Usage};

    fn entry_for(prompt: &str, answer: &str) -> CacheEntry {
        let request = InvocationRequest::new("gpt-4o").with_message(Message::user(prompt));
        CacheEntry::new(
            Fingerprinter::new().fingerprint(&request),
            CanonicalRequest::from_request(&request),
            CachedResponse::from_response(ModelResponse::new(answer, Usage::new(10, 5))),
        )
    }

    #[test]
    fn test_put_get() {
        let cache = ResponseCache::default();
        let entry = entry_for("q", "a");
        let key = entry.fingerprint;

        cache.put(entry);
        let hit = cache.get(&key).expect("entry should be cached");
        assert_eq!(hit.payload.response.text, "a");
    }

    #[test]
    fn test_put_never_replaces_live_entry() {
        let cache = ResponseCache::default();
        let first = entry_for("q", "first");
        let key = first.fingerprint;
        cache.put(first);

        let mut second = entry_for("q", "second");
        second.fingerprint = key;
        let stored = cache.put(second);

        assert_eq!(stored.payload.response.text, "first");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResponseCache::new(CacheConfig::default().with_max_entries(2));
        let a = entry_for("a", "A");
        let b = entry_for("b", "B");
        let c = entry_for("c", "C");
        let (ka, kb, kc) = (a.fingerprint, b.fingerprint, c.fingerprint);

        cache.put(a);
        cache.put(b);
        // Touch `a` so `b` becomes least recently used.
        assert!(cache.get(&ka).is_some());
        cache.put(c);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&ka).is_some());
        assert!(cache.get(&kb).is_none());
        assert!(cache.get(&kc).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let cache = ResponseCache::new(
            CacheConfig::default().with_ttl(Duration::from_millis(50)),
        );
        let entry = entry_for("q", "a");
        let key = entry.fingerprint;
        cache.put(entry);
        assert!(cache.get(&key).is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_snapshot_restores_entries() {
        let source = ResponseCache::default();
        let entry = entry_for("q", "a");
        let key = entry.fingerprint;
        source.put(entry);
        source.put(entry_for("q2", "b"));

        let bytes = source.export_snapshot().expect("export");
        let target = ResponseCache::default();
        assert_eq!(target.import_snapshot(&bytes).expect("import"), 2);
        assert_eq!(target.get(&key), source.get(&key));
    }

    #[test]
    fn test_snapshot_rejects_garbage() {
        let cache = ResponseCache::default();
        let err = cache
            .import_snapshot(&[0xde, 0xad, 0xbe, 0xef, 1, 0, 0, 0, 0])
            .expect_err("garbage must not load");
        assert!(matches!(
            err,
            Error::InvalidCacheEntry(_) | Error::DeserializationError(_)
        ));
    }

    #[test]
    fn test_concurrent_puts_respect_capacity() {
        let cache = Arc::new(ResponseCache::new(CacheConfig::default().with_max_entries(8)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        cache.put(entry_for(&format!("{}-{}", t, i), "x"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert!(cache.len() <= 8);
        assert_eq!(cache.len() as u64 + cache.stats().evictions, 200);
    }

    #[test]
    fn test_overflow_evicts_oldest_tenth() {
        let cache = ResponseCache::new(CacheConfig::default().with_max_entries(100));
        let entries: Vec<CacheEntry> = (0..101).map(|i| entry_for(&i.to_string(), "x")).collect();
        let keys: Vec<Fingerprint> = entries.iter().map(|e| e.fingerprint).collect();
        for entry in entries {
            cache.put(entry);
        }

        assert_eq!(cache.stats().evictions, 10);
        assert_eq!(cache.len(), 91);
        assert!(keys[..10].iter().all(|k| cache.get(k).is_none()));
        assert!(keys[10..].iter().all(|k| cache.get(k).is_some()));
    }
}
