//! Per-request cache strategies.
//!
//! Cache behavior is chosen explicitly on each request instead of through
//! boolean flags on the interceptor.
//!
//! | Strategy | Cache Hit | Cache Miss | Use Case |
//! |----------|-----------|-----------|----------|
//! | **Refresh** | Replay | Singleflight upstream call, store | Default |
//! | **Fresh** | Replay | `Error::CacheMiss` | Offline replay, tests |
//! | **Bypass** | Ignored | Upstream call, nothing stored | Debugging, non-idempotent tools |
//!
//! ```
//! use llm_cache_kit::strategy::CacheStrategy;
//!
//! assert_eq!(CacheStrategy::default(), CacheStrategy::Refresh);
//! assert!(CacheStrategy::Refresh.reads_cache());
//! assert!(!CacheStrategy::Bypass.writes_cache());
//! ```

/// Strategy enum controlling how the interceptor uses the response cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// **Fresh**: Cache only, never call upstream.
    ///
    /// Flow:
    /// 1. Check cache
    /// 2. If hit: replay cached response
    /// 3. If miss: fail with `Error::CacheMiss`
    Fresh,

    /// **Refresh**: Cache first, upstream on miss.
    ///
    /// Flow:
    /// 1. Check cache
    /// 2. If hit: replay cached response, emit savings
    /// 3. If miss: join the singleflight group for the fingerprint
    /// 4. Leader calls upstream and stores the complete response
    /// 5. Followers receive the leader's result
    #[default]
    Refresh,

    /// **Bypass**: Ignore the cache entirely.
    ///
    /// Flow:
    /// 1. Call upstream
    /// 2. Return the response without storing it
    Bypass,
}

impl CacheStrategy {
    pub fn reads_cache(&self) -> bool {
        !matches!(self, CacheStrategy::Bypass)
    }

    pub fn writes_cache(&self) -> bool {
        matches!(self, CacheStrategy::Refresh)
    }

    pub fn calls_upstream(&self) -> bool {
        !matches!(self, CacheStrategy::Fresh)
    }
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::Fresh => write!(f, "Fresh"),
            CacheStrategy::Refresh => write!(f, "Refresh"),
            CacheStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}
