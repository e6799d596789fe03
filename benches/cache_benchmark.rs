//! Performance benchmarks for llm-cache-kit
//!
//! This benchmark suite measures:
//! - Request fingerprinting across conversation lengths
//! - ResponseCache operations (get hit/miss, put with eviction)
//! - CachingInterceptor hit path and bypass path
//! - Snapshot export/import
//!
//! Run with: cargo bench
//! View results: open target/criterion/report/index.html

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_cache_kit::cache::{CacheEntry, CachedResponse};
use llm_cache_kit::fingerprint::CanonicalRequest;
use llm_cache_kit::{
    CacheConfig, CacheStrategy, CachingInterceptor, Fingerprinter, InvocationRequest, Message,
    ModelProvider, ModelResponse, ResponseCache, Result, Usage,
};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// Benchmark Test Fixtures
// ============================================================================

/// Provider that answers instantly with a fixed-size body.
struct BenchProvider {
    body: String,
}

#[async_trait]
impl ModelProvider for BenchProvider {
    async fn generate(&self, _request: &InvocationRequest) -> Result<ModelResponse> {
        Ok(ModelResponse::new(self.body.clone(), Usage::new(1_000, 250)))
    }
}

/// A conversation with `turns` user/assistant pairs of ~200 chars each.
fn conversation(turns: usize, tag: u64) -> InvocationRequest {
    let mut request = InvocationRequest::new("chat-model-large")
        .with_system("Extract the invoice as JSON.")
        .with_tools(["createDocument", "getWeather", "updateDocument"]);
    for i in 0..turns {
        request = request
            .with_message(Message::user(format!("question {} {} {}", tag, i, "x".repeat(180))))
            .with_message(Message::assistant(format!("answer {} {}", i, "y".repeat(190))));
    }
    request
}

fn entry_for(fingerprinter: &Fingerprinter, request: &InvocationRequest, body_size: usize) -> CacheEntry {
    CacheEntry::new(
        fingerprinter.fingerprint(request),
        CanonicalRequest::from_request(request),
        CachedResponse::from_response(ModelResponse::new("z".repeat(body_size), Usage::new(1_000, 250))),
    )
}

// ============================================================================
// Group 1: Fingerprint Benchmarks
// ============================================================================

fn fingerprint_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let fingerprinter = Fingerprinter::new();

    for turns in [1, 10, 50].iter() {
        let request = conversation(*turns, 0);
        group
            .throughput(Throughput::Elements(*turns as u64 * 2))
            .bench_with_input(BenchmarkId::new("request", turns), &request, |b, request| {
                b.iter(|| fingerprinter.fingerprint(black_box(request)));
            });
    }

    group.finish();
}

// ============================================================================
// Group 2: ResponseCache Benchmarks
// ============================================================================

fn response_cache_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_cache");
    let fingerprinter = Fingerprinter::new();

    for size in [100, 10_000].iter() {
        group
            .throughput(Throughput::Bytes(*size as u64))
            .bench_with_input(BenchmarkId::new("get_hit", size), size, |b, &size| {
                let cache = ResponseCache::default();
                let request = conversation(4, 0);
                let key = fingerprinter.fingerprint(&request);
                cache.put(entry_for(&fingerprinter, &request, size));

                b.iter(|| cache.get(black_box(&key)));
            });
    }

    group.bench_function("get_miss", |b| {
        let cache = ResponseCache::default();
        let key = fingerprinter.fingerprint(&conversation(1, 42));

        b.iter(|| cache.get(black_box(&key)));
    });

    // Puts past capacity evict the least recently used tenth in one scan.
    group.bench_function("put_at_capacity", |b| {
        let cache = ResponseCache::new(CacheConfig::default().with_max_entries(256));
        let counter = AtomicU64::new(0);

        b.iter(|| {
            let request = conversation(1, counter.fetch_add(1, Ordering::Relaxed));
            cache.put(black_box(entry_for(&fingerprinter, &request, 500)))
        });
    });

    group.bench_function("snapshot_export", |b| {
        let cache = ResponseCache::default();
        for i in 0..100 {
            cache.put(entry_for(&fingerprinter, &conversation(2, i), 1_000));
        }

        b.iter(|| cache.export_snapshot());
    });

    group.finish();
}

// ============================================================================
// Group 3: CachingInterceptor Benchmarks
// ============================================================================

fn interceptor_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("caching_interceptor");

    // Create tokio runtime for async operations
    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");

    // Refresh strategy - CACHE HIT
    // Measures: fingerprint + lookup + replay + savings record
    group.bench_function("refresh_hit", |b| {
        let provider = Arc::new(BenchProvider {
            body: "z".repeat(2_000),
        });
        let interceptor = CachingInterceptor::new(provider, Arc::new(ResponseCache::default()));
        let request = conversation(4, 0);
        rt.block_on(async {
            interceptor
                .generate(&request)
                .await
                .expect("Failed to populate cache");
        });

        b.to_async(&rt)
            .iter(|| async { interceptor.generate(black_box(&request)).await });
    });

    // Bypass strategy
    // Measures: the interceptor overhead on top of the provider call
    group.bench_function("bypass", |b| {
        let provider = Arc::new(BenchProvider {
            body: "z".repeat(2_000),
        });
        let interceptor = CachingInterceptor::new(provider, Arc::new(ResponseCache::default()));
        let request = conversation(4, 0).with_strategy(CacheStrategy::Bypass);

        b.to_async(&rt)
            .iter(|| async { interceptor.generate(black_box(&request)).await });
    });

    group.finish();
}

// ============================================================================
// Benchmark Registration
// ============================================================================

criterion_group!(
    benches,
    fingerprint_benchmarks,
    response_cache_benchmarks,
    interceptor_benchmarks
);
criterion_main!(benches);
