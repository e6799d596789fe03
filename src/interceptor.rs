//! Cache-backed decorator for any [`ModelProvider`].
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CachingInterceptor                       │
//! │  request ──► fingerprint ──► cache hit? ──► replay, savings │
//! │                                  │                          │
//! │                                 miss                        │
//! │                                  ▼                          │
//! │                     singleflight group for key              │
//! │              leader: upstream call, store when complete     │
//! │              followers: await leader, replay, savings       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A response is stored only once it is complete: for `generate` when the
//! upstream call returns `Ok`, for `stream` when the terminal `Finish` chunk
//! has passed through. Errors, incomplete streams and streams dropped by the
//! caller leave the cache untouched, and the singleflight group is released
//! so a waiting caller can take over.

use crate::cache::{CacheEntry, CachedResponse, Flight, LeaderGuard, ResponseCache, SingleFlight};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{CanonicalRequest, Fingerprint, Fingerprinter};
use crate::model::InputTokenSavingsRecord;
use crate::observability::{CacheCounters, CacheMetrics, LogSavings, SavingsSink};
use crate::provider::ModelProvider;
use crate::request::{ChunkStream, InvocationRequest, ModelResponse, ResponseChunk};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// How a cache-reading request was resolved.
enum Resolution {
    /// Served from the cache or from another caller's upstream call.
    Cached(Arc<CacheEntry>),
    /// This caller must call upstream and publish the result.
    Lead(LeaderGuard<Arc<CacheEntry>>),
    /// Fingerprint collision with an in-flight call; go upstream uncached.
    Direct,
}

/// Writes completed responses into the cache.
#[derive(Clone)]
struct Recorder {
    cache: Arc<ResponseCache>,
    metrics: Arc<dyn CacheMetrics>,
    key: Fingerprint,
    canonical: CanonicalRequest,
}

impl Recorder {
    fn commit(&self, payload: CachedResponse) -> Arc<CacheEntry> {
        let entry = CacheEntry::new(self.key, self.canonical.clone(), payload);
        let stored = self.cache.put(entry.clone());
        if stored.request != self.canonical {
            // Slot is held by a colliding request; hand our own answer back.
            warn!(
                "Fingerprint {} is held by a different request; response not cached",
                self.key.short()
            );
            return Arc::new(entry);
        }
        self.metrics.record_store(&self.key);
        stored
    }
}

/// A [`ModelProvider`] that answers repeated requests from a
/// [`ResponseCache`] and coalesces concurrent identical misses.
///
/// # Example
///
/// ```ignore
/// let registry = Arc::new(ModelRegistry::new().with_provider("gpt-4o", openai));
/// let interceptor = CachingInterceptor::new(registry, Arc::new(ResponseCache::default()))
///     .with_savings(Arc::new(GatewaySavings::new(gateway.clone())));
///
/// let response = interceptor.generate(&request).await?;
/// ```
pub struct CachingInterceptor {
    inner: Arc<dyn ModelProvider>,
    cache: Arc<ResponseCache>,
    flights: SingleFlight<Arc<CacheEntry>>,
    fingerprinter: Fingerprinter,
    verify_on_hit: bool,
    metrics: Arc<dyn CacheMetrics>,
    savings: Arc<dyn SavingsSink>,
}

impl CachingInterceptor {
    pub fn new(inner: Arc<dyn ModelProvider>, cache: Arc<ResponseCache>) -> Self {
        CachingInterceptor {
            inner,
            cache,
            flights: SingleFlight::new(),
            fingerprinter: Fingerprinter::new(),
            verify_on_hit: true,
            metrics: Arc::new(CacheCounters::new()),
            savings: Arc::new(LogSavings),
        }
    }

    /// Build with a fresh cache. Loads the snapshot at
    /// `config.snapshot_path` when the file exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` for an invalid configuration, or the
    /// snapshot decoding error if the snapshot file is unreadable.
    pub fn from_config(inner: Arc<dyn ModelProvider>, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let cache = ResponseCache::new(config.clone());
        if let Some(path) = config.snapshot_path.as_deref().filter(|p| p.exists()) {
            cache.load_snapshot(path)?;
        }
        Ok(Self::new(inner, Arc::new(cache)).with_verify_on_hit(config.verify_on_hit))
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    pub fn with_verify_on_hit(mut self, verify: bool) -> Self {
        self.verify_on_hit = verify;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_savings(mut self, savings: Arc<dyn SavingsSink>) -> Self {
        self.savings = savings;
        self
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn fingerprint(&self, request: &InvocationRequest) -> Fingerprint {
        self.fingerprinter.fingerprint(request)
    }

    /// Look up a live entry, verifying it against `canonical` if enabled.
    fn lookup(&self, key: &Fingerprint, canonical: &CanonicalRequest) -> Option<Arc<CacheEntry>> {
        let entry = self.cache.get(key)?;
        if self.verify_on_hit && entry.request != *canonical {
            let mismatch = Error::IntegrityMismatch(format!(
                "entry {} was stored for another request",
                key.short()
            ));
            self.metrics.record_integrity_mismatch(key);
            debug!("{}; treating as miss", mismatch);
            return None;
        }
        Some(entry)
    }

    async fn resolve(&self, key: Fingerprint, canonical: &CanonicalRequest) -> Result<Resolution> {
        let started = Instant::now();
        loop {
            if let Some(entry) = self.lookup(&key, canonical) {
                self.metrics.record_hit(&key, started.elapsed());
                return Ok(Resolution::Cached(entry));
            }

            match self.flights.join(key) {
                Flight::Leader(guard) => {
                    // A previous leader may have stored between lookup and join.
                    if let Some(entry) = self.lookup(&key, canonical) {
                        guard.complete(Ok(Arc::clone(&entry)));
                        self.metrics.record_hit(&key, started.elapsed());
                        return Ok(Resolution::Cached(entry));
                    }
                    self.metrics.record_miss(&key, started.elapsed());
                    return Ok(Resolution::Lead(guard));
                }
                Flight::Follower(waiter) => match waiter.wait().await {
                    Some(Ok(entry)) if entry.request == *canonical => {
                        self.metrics.record_coalesced(&key, started.elapsed());
                        return Ok(Resolution::Cached(entry));
                    }
                    Some(Ok(_)) => {
                        self.metrics.record_integrity_mismatch(&key);
                        return Ok(Resolution::Direct);
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("Leader for {} went away; rejoining", key.short());
                    }
                },
            }
        }
    }

    fn recorder(&self, key: Fingerprint, canonical: CanonicalRequest) -> Recorder {
        Recorder {
            cache: Arc::clone(&self.cache),
            metrics: Arc::clone(&self.metrics),
            key,
            canonical,
        }
    }

    fn emit_savings(&self, request: &InvocationRequest, entry: &CacheEntry) {
        let record = InputTokenSavingsRecord::new(
            request.metadata.chat_id.clone(),
            request.metadata.message_id.clone(),
            entry.payload.total_tokens(),
        );
        self.savings.record(record);
    }

    fn fail(&self, key: &Fingerprint, guard: LeaderGuard<Arc<CacheEntry>>, error: &Error) {
        self.metrics.record_error(key, &error.to_string());
        guard.complete(Err(error.clone()));
    }
}

fn replay(entry: &CacheEntry) -> ChunkStream {
    stream::iter(entry.payload.replay_chunks().into_iter().map(Ok)).boxed()
}

#[async_trait]
impl ModelProvider for CachingInterceptor {
    async fn generate(&self, request: &InvocationRequest) -> Result<ModelResponse> {
        let strategy = request.metadata.strategy;
        if !strategy.reads_cache() {
            return self.inner.generate(request).await;
        }

        let canonical = CanonicalRequest::from_request(request);
        let key = self.fingerprinter.fingerprint_canonical(&canonical);

        if !strategy.calls_upstream() {
            let entry = self.lookup(&key, &canonical).ok_or(Error::CacheMiss)?;
            self.emit_savings(request, &entry);
            return Ok(entry.payload.response.clone());
        }

        match self.resolve(key, &canonical).await? {
            Resolution::Cached(entry) => {
                self.emit_savings(request, &entry);
                Ok(entry.payload.response.clone())
            }
            Resolution::Direct => self.inner.generate(request).await,
            Resolution::Lead(guard) => match self.inner.generate(request).await {
                Ok(response) => {
                    let entry = self
                        .recorder(key, canonical)
                        .commit(CachedResponse::from_response(response.clone()));
                    guard.complete(Ok(entry));
                    Ok(response)
                }
                Err(e) => {
                    self.fail(&key, guard, &e);
                    Err(e)
                }
            },
        }
    }

    async fn stream(&self, request: &InvocationRequest) -> Result<ChunkStream> {
        let strategy = request.metadata.strategy;
        if !strategy.reads_cache() {
            return self.inner.stream(request).await;
        }

        let canonical = CanonicalRequest::from_request(request);
        let key = self.fingerprinter.fingerprint_canonical(&canonical);

        if !strategy.calls_upstream() {
            let entry = self.lookup(&key, &canonical).ok_or(Error::CacheMiss)?;
            self.emit_savings(request, &entry);
            return Ok(replay(&entry));
        }

        match self.resolve(key, &canonical).await? {
            Resolution::Cached(entry) => {
                self.emit_savings(request, &entry);
                Ok(replay(&entry))
            }
            Resolution::Direct => self.inner.stream(request).await,
            Resolution::Lead(guard) => match self.inner.stream(request).await {
                Ok(upstream) => Ok(RecordingStream {
                    upstream,
                    chunks: Vec::new(),
                    guard: Some(guard),
                    recorder: self.recorder(key, canonical),
                    done: false,
                }
                .boxed()),
                Err(e) => {
                    self.fail(&key, guard, &e);
                    Err(e)
                }
            },
        }
    }
}

/// Forwards upstream chunks to the caller while buffering them, and commits
/// the buffer once the terminal chunk has gone through.
struct RecordingStream {
    upstream: ChunkStream,
    chunks: Vec<ResponseChunk>,
    guard: Option<LeaderGuard<Arc<CacheEntry>>>,
    recorder: Recorder,
    done: bool,
}

impl RecordingStream {
    fn finish(&mut self) {
        self.done = true;
        let Some(guard) = self.guard.take() else {
            return;
        };
        match CachedResponse::from_chunks(std::mem::take(&mut self.chunks)) {
            Some(payload) => guard.complete(Ok(self.recorder.commit(payload))),
            None => self.abort(guard, Error::IncompleteStream("no terminal chunk".to_string())),
        }
    }

    fn abort(&mut self, guard: LeaderGuard<Arc<CacheEntry>>, error: Error) {
        self.done = true;
        self.chunks.clear();
        self.recorder
            .metrics
            .record_error(&self.recorder.key, &error.to_string());
        guard.complete(Err(error));
    }
}

impl Stream for RecordingStream {
    type Item = Result<ResponseChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        match this.upstream.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                let terminal = chunk.is_terminal();
                this.chunks.push(chunk.clone());
                if terminal {
                    this.finish();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(guard) = this.guard.take() {
                    this.abort(guard, e.clone());
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                let error = Error::IncompleteStream(format!(
                    "upstream stream for {} ended before its usage chunk",
                    this.recorder.key.short()
                ));
                if let Some(guard) = this.guard.take() {
                    this.abort(guard, error.clone());
                }
                Poll::Ready(Some(Err(error)))
            }
        }
    }
}

impl Drop for RecordingStream {
    fn drop(&mut self) {
        if self.guard.is_some() {
            let cancelled = Error::Cancelled(format!(
                "stream dropped after {} chunks; nothing cached",
                self.chunks.len()
            ));
            self.recorder
                .metrics
                .record_error(&self.recorder.key, &cancelled.to_string());
        }
    }
}
