//! Metrics and savings telemetry for the caching interceptor.
//!
//! Two separate hooks:
//!
//! - **Metrics (`CacheMetrics`)**: hits, misses, coalesced waits, stores,
//!   integrity mismatches and upstream errors, with timings.
//! - **Savings (`SavingsSink`)**: one [`InputTokenSavingsRecord`] per request
//!   answered without an upstream call.
//!
//! Both are fire-and-forget. Nothing here can fail a generation.
//!
//! ```
//! use llm_cache_kit::observability::{CacheCounters, CacheMetrics};
//! use llm_cache_kit::fingerprint::Fingerprint;
//! use std::time::Duration;
//!
//! let counters = CacheCounters::new();
//! let key = Fingerprint::from_bytes([0; 32]);
//! counters.record_hit(&key, Duration::from_millis(1));
//! counters.record_miss(&key, Duration::from_millis(3));
//!
//! let snapshot = counters.snapshot();
//! assert_eq!(snapshot.hits, 1);
//! assert_eq!(snapshot.misses, 1);
//! ```

use crate::fingerprint::Fingerprint;
use crate::model::InputTokenSavingsRecord;
use crate::persistence::PersistenceGateway;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, key: &Fingerprint, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key.short(), duration);
    }

    /// Record a cache miss that went upstream.
    fn record_miss(&self, key: &Fingerprint, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key.short(), duration);
    }

    /// Record a caller that waited on another caller's upstream call.
    fn record_coalesced(&self, key: &Fingerprint, duration: Duration) {
        debug!("Cache COALESCED: {} waited {:?}", key.short(), duration);
    }

    /// Record a completed response written to the cache.
    fn record_store(&self, key: &Fingerprint) {
        debug!("Cache STORE: {}", key.short());
    }

    /// Record a fingerprint whose stored request did not match.
    fn record_integrity_mismatch(&self, key: &Fingerprint) {
        warn!("Cache INTEGRITY MISMATCH: {}", key.short());
    }

    /// Record an upstream failure.
    fn record_error(&self, key: &Fingerprint, error: &str) {
        warn!("Cache ERROR for {}: {}", key.short(), error);
    }
}

/// Metrics implementation that discards every event.
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &Fingerprint, _duration: Duration) {}
    fn record_miss(&self, _key: &Fingerprint, _duration: Duration) {}
    fn record_coalesced(&self, _key: &Fingerprint, _duration: Duration) {}
    fn record_store(&self, _key: &Fingerprint) {}
    fn record_integrity_mismatch(&self, _key: &Fingerprint) {}
    fn record_error(&self, _key: &Fingerprint, _error: &str) {}
}

/// Atomic event counters. The default metrics of a `CachingInterceptor`.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    stores: AtomicU64,
    integrity_mismatches: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`CacheCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub stores: u64,
    pub integrity_mismatches: u64,
    pub errors: u64,
}

impl CounterSnapshot {
    /// Requests served without an upstream call of their own.
    pub fn upstream_calls_avoided(&self) -> u64 {
        self.hits + self.coalesced
    }
}

impl CacheCounters {
    pub fn new() -> Self {
        CacheCounters::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            integrity_mismatches: self.integrity_mismatches.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl CacheMetrics for CacheCounters {
    fn record_hit(&self, key: &Fingerprint, duration: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!("Cache HIT: {} took {:?}", key.short(), duration);
    }

    fn record_miss(&self, key: &Fingerprint, duration: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!("Cache MISS: {} took {:?}", key.short(), duration);
    }

    fn record_coalesced(&self, key: &Fingerprint, duration: Duration) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
        trace!("Cache COALESCED: {} waited {:?}", key.short(), duration);
    }

    fn record_store(&self, _key: &Fingerprint) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    fn record_integrity_mismatch(&self, key: &Fingerprint) {
        self.integrity_mismatches.fetch_add(1, Ordering::Relaxed);
        warn!("Cache INTEGRITY MISMATCH: {}", key.short());
    }

    fn record_error(&self, key: &Fingerprint, error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        debug!("Cache ERROR for {}: {}", key.short(), error);
    }
}

/// Receives savings records. Must not block.
pub trait SavingsSink: Send + Sync {
    fn record(&self, savings: InputTokenSavingsRecord);
}

/// Drops every record after logging it.
#[derive(Clone, Default)]
pub struct LogSavings;

impl SavingsSink for LogSavings {
    fn record(&self, savings: InputTokenSavingsRecord) {
        debug!(
            "Saved {} input tokens (chat {:?}, message {:?})",
            savings.tokens, savings.chat_id, savings.message_id
        );
    }
}

/// Keeps records in memory. Useful in tests.
#[derive(Default)]
pub struct CollectingSavings {
    records: Mutex<Vec<InputTokenSavingsRecord>>,
}

impl CollectingSavings {
    pub fn new() -> Self {
        CollectingSavings::default()
    }

    pub fn records(&self) -> Vec<InputTokenSavingsRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.records().iter().map(|r| r.tokens).sum()
    }
}

impl SavingsSink for CollectingSavings {
    fn record(&self, savings: InputTokenSavingsRecord) {
        match self.records.lock() {
            Ok(mut records) => records.push(savings),
            Err(poisoned) => poisoned.into_inner().push(savings),
        }
    }
}

/// Writes records through a [`PersistenceGateway`] on a detached task.
pub struct GatewaySavings {
    gateway: Arc<dyn PersistenceGateway>,
}

impl GatewaySavings {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        GatewaySavings { gateway }
    }
}

impl SavingsSink for GatewaySavings {
    fn record(&self, savings: InputTokenSavingsRecord) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No async runtime; dropping savings record of {} tokens",
                savings.tokens
            );
            return;
        };
        let gateway = Arc::clone(&self.gateway);
        handle.spawn(async move {
            if let Err(e) = gateway.save_input_tokens(savings).await {
                error!("Failed to save input token savings: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Fingerprint {
        Fingerprint::from_bytes([7; 32])
    }

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        metrics.record_hit(&key(), Duration::from_secs(1));
        metrics.record_miss(&key(), Duration::from_secs(2));
        metrics.record_error(&key(), "boom");
    }

    #[test]
    fn test_counters() {
        let counters = CacheCounters::new();
        counters.record_hit(&key(), Duration::ZERO);
        counters.record_coalesced(&key(), Duration::ZERO);
        counters.record_coalesced(&key(), Duration::ZERO);
        counters.record_store(&key());
        counters.record_integrity_mismatch(&key());

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.coalesced, 2);
        assert_eq!(snapshot.stores, 1);
        assert_eq!(snapshot.integrity_mismatches, 1);
        assert_eq!(snapshot.upstream_calls_avoided(), 3);
    }

    #[test]
    fn test_collecting_savings() {
        let sink = CollectingSavings::new();
        sink.record(InputTokenSavingsRecord::new(Some("c".into()), None, 10));
        sink.record(InputTokenSavingsRecord::new(None, None, 5));
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.total_tokens(), 15);
    }
}
