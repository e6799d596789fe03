//! # llm-cache-kit
//!
//! A response cache for billed, non-deterministic model calls, and the
//! accounting pipeline that turns model output into invoice and usage records.
//!
//! ## Features
//!
//! - **Transparent:** [`CachingInterceptor`] implements the same
//!   [`ModelProvider`] trait as the provider it wraps
//! - **Deterministic keys:** SHA-256 fingerprints over a canonical request form
//! - **Bounded:** LRU eviction at a configured entry count, optional TTL
//! - **Singleflight:** concurrent identical misses share one upstream call
//! - **Never poisoned:** only fully terminated responses are stored
//! - **Exact money:** costs are `rust_decimal::Decimal`, never floats
//!
//! ## Quick Start
//!
//! ```ignore
//! use llm_cache_kit::{
//!     AccountingPipeline, CachingInterceptor, ChatService, ModelRegistry,
//!     ResponseCache, UsageAccountant,
//!     observability::GatewaySavings,
//!     persistence::InMemoryGateway,
//! };
//! use std::sync::Arc;
//!
//! // 1. Providers, built once and passed down explicitly
//! let registry = ModelRegistry::new()
//!     .with_provider("chat-model-large", Arc::new(my_openai_provider));
//!
//! // 2. Cache in front of every model
//! let gateway = Arc::new(InMemoryGateway::new());
//! let interceptor = CachingInterceptor::new(Arc::new(registry), Arc::new(ResponseCache::default()))
//!     .with_savings(Arc::new(GatewaySavings::new(gateway.clone())));
//!
//! // 3. Accounting after each turn
//! let pipeline = AccountingPipeline::new(UsageAccountant::default(), gateway);
//! let chat = ChatService::new(Arc::new(interceptor), Arc::new(pipeline));
//!
//! let reply = chat.generate("user-1", request.with_chat("chat-1", "msg-2")).await?;
//! ```

#[macro_use]
extern crate log;

pub mod cache;
pub mod chat;
pub mod config;
pub mod dates;
pub mod edit;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod interceptor;
pub mod model;
pub mod observability;
pub mod persistence;
pub mod pipeline;
pub mod pricing;
pub mod provider;
pub mod request;
pub mod serialization;
pub mod strategy;

// Re-exports for convenience
pub use cache::{CacheEntry, CachedResponse, ResponseCache};
pub use chat::ChatService;
pub use config::{CacheConfig, Config};
pub use error::{Error, Result};
pub use extract::InvoiceExtractor;
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use interceptor::CachingInterceptor;
pub use persistence::PersistenceGateway;
pub use pipeline::AccountingPipeline;
pub use pricing::UsageAccountant;
pub use provider::{ModelProvider, ModelRegistry};
pub use request::{InvocationRequest, Message, ModelResponse, ResponseChunk, Usage};
pub use strategy::CacheStrategy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
