//! Integration tests for the caching interceptor
//!
//! These tests drive `CachingInterceptor` against a call-counting provider
//! and verify hit replay, singleflight coalescing, and that nothing
//! incomplete is ever cached.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use llm_cache_kit::cache::{CacheEntry, CachedResponse, ResponseCache};
use llm_cache_kit::config::CacheConfig;
use llm_cache_kit::fingerprint::CanonicalRequest;
use llm_cache_kit::observability::{CacheCounters, CollectingSavings};
use llm_cache_kit::request::{ChunkStream, FinishReason, ResponseChunk};
use llm_cache_kit::{
    CacheStrategy, CachingInterceptor, Error, InvocationRequest, Message, ModelProvider,
    ModelResponse, Result, Usage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// Test Provider
// ============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Succeed,
    Fail,
    /// First stream call yields one chunk and then never finishes.
    StallFirstStream,
}

/// Provider that counts calls and can be held at a gate.
struct MockProvider {
    calls: AtomicUsize,
    mode: Mode,
    gate: watch::Receiver<bool>,
}

impl MockProvider {
    fn new(mode: Mode) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(true);
        let provider = Arc::new(MockProvider {
            calls: AtomicUsize::new(0),
            mode,
            gate: rx,
        });
        (provider, tx)
    }

    fn gated(mode: Mode) -> (Arc<Self>, watch::Sender<bool>) {
        let (provider, tx) = Self::new(mode);
        tx.send_replace(false);
        (provider, tx)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
    }
}

fn answer(request: &InvocationRequest) -> ModelResponse {
    let last = request
        .messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default();
    ModelResponse::new(format!("echo: {}", last), Usage::new(120, 30))
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(&self, request: &InvocationRequest) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        match self.mode {
            Mode::Fail => Err(Error::TransportError("upstream returned 503".to_string())),
            _ => Ok(answer(request)),
        }
    }

    async fn stream(&self, request: &InvocationRequest) -> Result<ChunkStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        match self.mode {
            Mode::Fail => Err(Error::TransportError("upstream returned 503".to_string())),
            Mode::StallFirstStream if call == 0 => {
                let first = stream::iter(vec![Ok(ResponseChunk::TextDelta("echo: ".to_string()))]);
                Ok(first.chain(stream::pending()).boxed())
            }
            _ => {
                let response = answer(request);
                let chunks = vec![
                    ResponseChunk::TextDelta(response.text.clone()),
                    ResponseChunk::Finish {
                        usage: response.usage,
                        finish_reason: FinishReason::Stop,
                    },
                ];
                Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
            }
        }
    }
}

fn request(content: &str) -> InvocationRequest {
    InvocationRequest::new("chat-model-large")
        .with_system("Extract the invoice.")
        .with_message(Message::user(content))
        .with_tools(["createDocument", "getWeather"])
        .with_chat("chat-1", "msg-1")
}

fn setup(
    provider: Arc<MockProvider>,
) -> (Arc<CachingInterceptor>, Arc<CollectingSavings>, Arc<CacheCounters>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let savings = Arc::new(CollectingSavings::new());
    let counters = Arc::new(CacheCounters::new());
    let interceptor = CachingInterceptor::new(provider, Arc::new(ResponseCache::default()))
        .with_savings(savings.clone())
        .with_metrics(counters.clone());
    (Arc::new(interceptor), savings, counters)
}

// ============================================================================
// Hits
// ============================================================================

/// Test 1: Second identical call is served from the cache
///
/// - Exactly one upstream invocation
/// - Savings equal the first call's total tokens
#[tokio::test]
async fn test_hit_avoids_upstream_and_records_savings() {
    let (provider, _gate) = MockProvider::new(Mode::Succeed);
    let (interceptor, savings, counters) = setup(provider.clone());

    let first = interceptor.generate(&request("invoice 42")).await.unwrap();
    assert!(savings.records().is_empty());

    let second = interceptor.generate(&request("invoice 42")).await.unwrap();

    assert_eq!(provider.calls(), 1);
    assert_eq!(first, second);

    let records = savings.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tokens, first.usage.total_tokens());
    assert_eq!(records[0].chat_id.as_deref(), Some("chat-1"));
    assert_eq!(records[0].message_id.as_deref(), Some("msg-1"));

    let stats = counters.snapshot();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.stores, 1);
}

/// Test 2: Tool order and request metadata do not change the key
#[tokio::test]
async fn test_equivalent_requests_share_entry() {
    let (provider, _gate) = MockProvider::new(Mode::Succeed);
    let (interceptor, _, _) = setup(provider.clone());

    interceptor.generate(&request("same")).await.unwrap();

    let reordered = InvocationRequest::new("chat-model-large")
        .with_system("Extract the invoice.")
        .with_message(Message::user("same"))
        .with_tools(["getWeather", "createDocument"])
        .with_chat("chat-2", "msg-9");
    interceptor.generate(&reordered).await.unwrap();
    assert_eq!(provider.calls(), 1);

    interceptor.generate(&request("different")).await.unwrap();
    assert_eq!(provider.calls(), 2);
}

// ============================================================================
// Singleflight
// ============================================================================

/// Test 3: 50 concurrent identical requests cost one upstream call
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_requests_coalesce() {
    let (provider, gate) = MockProvider::gated(Mode::Succeed);
    let (interceptor, savings, counters) = setup(provider.clone());

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let interceptor = Arc::clone(&interceptor);
            tokio::spawn(async move { interceptor.generate(&request("burst")).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.send_replace(true);

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(provider.calls(), 1);
    assert!(responses.iter().all(|r| *r == responses[0]));

    let stats = counters.snapshot();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.upstream_calls_avoided(), 49);
    assert_eq!(savings.records().len(), 49);
}

/// Test 4: An upstream failure reaches every waiter and is not cached
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_propagates_to_all_waiters() {
    let (provider, gate) = MockProvider::gated(Mode::Fail);
    let (interceptor, savings, _) = setup(provider.clone());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let interceptor = Arc::clone(&interceptor);
            tokio::spawn(async move { interceptor.generate(&request("flaky")).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.send_replace(true);

    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::TransportError(_))));
    }

    assert_eq!(provider.calls(), 1);
    assert!(interceptor.cache().is_empty());
    assert!(savings.records().is_empty());

    let _ = interceptor.generate(&request("flaky")).await;
    assert_eq!(provider.calls(), 2);
}

/// Test 5: A cancelled leader hands off to a waiting follower
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_leader_hands_off() {
    let (provider, _gate) = MockProvider::new(Mode::StallFirstStream);
    let (interceptor, _, _) = setup(provider.clone());

    let mut leader = interceptor.stream(&request("handoff")).await.unwrap();
    let first = leader.next().await.unwrap().unwrap();
    assert_eq!(first, ResponseChunk::TextDelta("echo: ".to_string()));

    let follower = {
        let interceptor = Arc::clone(&interceptor);
        tokio::spawn(async move { interceptor.generate(&request("handoff")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(leader);

    let response = tokio::time::timeout(Duration::from_secs(5), follower)
        .await
        .expect("follower must not hang after the leader is dropped")
        .unwrap()
        .unwrap();

    assert_eq!(response.text, "echo: handoff");
    assert_eq!(provider.calls(), 2);
    assert_eq!(interceptor.cache().len(), 1);
}

// ============================================================================
// No poisoning
// ============================================================================

/// Test 6: A stream abandoned before its usage chunk leaves no entry
#[tokio::test]
async fn test_aborted_stream_is_not_cached() {
    let (provider, _gate) = MockProvider::new(Mode::StallFirstStream);
    let (interceptor, savings, _) = setup(provider.clone());

    let mut aborted = interceptor.stream(&request("abort")).await.unwrap();
    aborted.next().await.unwrap().unwrap();
    drop(aborted);

    assert!(interceptor.cache().is_empty());

    let chunks: Vec<_> = interceptor
        .stream(&request("abort"))
        .await
        .unwrap()
        .collect()
        .await;
    assert!(chunks.iter().all(|c| c.is_ok()));
    assert!(chunks.last().unwrap().as_ref().unwrap().is_terminal());
    assert_eq!(provider.calls(), 2);
    assert_eq!(interceptor.cache().len(), 1);
    assert!(savings.records().is_empty());
}

/// Test 7: A failed stream setup is propagated and not cached
#[tokio::test]
async fn test_stream_error_is_not_cached() {
    let (provider, _gate) = MockProvider::new(Mode::Fail);
    let (interceptor, _, counters) = setup(provider.clone());

    let result = interceptor.stream(&request("down")).await;
    assert!(matches!(result, Err(Error::TransportError(_))));
    assert!(interceptor.cache().is_empty());
    assert_eq!(counters.snapshot().errors, 1);
}

// ============================================================================
// Integrity and strategies
// ============================================================================

/// Test 8: An entry stored for a different request is treated as a miss
#[tokio::test]
async fn test_integrity_mismatch_is_a_miss() {
    let (provider, _gate) = MockProvider::new(Mode::Succeed);
    let (interceptor, savings, counters) = setup(provider.clone());

    let req = request("real question");
    let key = interceptor.fingerprint(&req);
    interceptor.cache().put(CacheEntry::new(
        key,
        CanonicalRequest::from_request(&request("some other question")),
        CachedResponse::from_response(ModelResponse::new("wrong answer", Usage::new(1, 1))),
    ));

    let response = interceptor.generate(&req).await.unwrap();

    assert_eq!(response.text, "echo: real question");
    assert_eq!(provider.calls(), 1);
    assert!(counters.snapshot().integrity_mismatches >= 1);
    assert!(savings.records().is_empty());
}

/// Test 9: Bypass never touches the cache; Fresh never calls upstream
#[tokio::test]
async fn test_strategies() {
    let (provider, _gate) = MockProvider::new(Mode::Succeed);
    let (interceptor, _, _) = setup(provider.clone());

    let bypass = request("q").with_strategy(CacheStrategy::Bypass);
    interceptor.generate(&bypass).await.unwrap();
    interceptor.generate(&bypass).await.unwrap();
    assert_eq!(provider.calls(), 2);
    assert!(interceptor.cache().is_empty());

    let fresh = request("q").with_strategy(CacheStrategy::Fresh);
    assert_eq!(interceptor.generate(&fresh).await, Err(Error::CacheMiss));
    assert_eq!(provider.calls(), 2);
}

/// Test 10: Entries survive a restart through a snapshot
#[tokio::test]
async fn test_snapshot_restores_entries() {
    let (provider, _gate) = MockProvider::new(Mode::Succeed);
    let (first, _, _) = setup(provider.clone());
    first.generate(&request("persist me")).await.unwrap();
    let bytes = first.cache().export_snapshot().unwrap();

    let cache = ResponseCache::new(CacheConfig::default());
    assert_eq!(cache.import_snapshot(&bytes).unwrap(), 1);
    let second = CachingInterceptor::new(provider.clone(), Arc::new(cache));

    let fresh = request("persist me").with_strategy(CacheStrategy::Fresh);
    let response = second.generate(&fresh).await.unwrap();
    assert_eq!(response.text, "echo: persist me");
    assert_eq!(provider.calls(), 1);
}
