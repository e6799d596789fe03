//! Model invocation contract and the provider registry.
//!
//! [`ModelProvider`] is the one capability the rest of the crate depends on:
//! generate a full response, or stream chunks ending in a terminal usage
//! chunk. Concrete transports implement it; the caching interceptor
//! implements it too, so either can stand in for the other.
//!
//! [`ModelRegistry`] maps model ids to providers. Build it once at start-up
//! and pass it by reference (or inside an `Arc`) to whatever needs it.

use crate::error::{Error, Result};
use crate::request::{ChunkStream, InvocationRequest, ModelResponse};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A model invocation capability.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a complete response.
    async fn generate(&self, request: &InvocationRequest) -> Result<ModelResponse>;

    /// Stream a response. The last item of a successful stream is
    /// `ResponseChunk::Finish` carrying usage.
    ///
    /// The default implementation generates the full response and replays
    /// it as chunks.
    async fn stream(&self, request: &InvocationRequest) -> Result<ChunkStream> {
        let response = self.generate(request).await?;
        Ok(stream::iter(response.to_chunks().into_iter().map(Ok)).boxed())
    }
}

/// Model id → provider.
///
/// The registry is itself a [`ModelProvider`] that routes on
/// `request.model_id`, so a single interceptor can sit in front of every
/// model:
///
/// ```ignore
/// let registry = ModelRegistry::new()
///     .with_provider("chat-model-large", openai.clone())
///     .with_provider("chat-model-large-claude", anthropic);
/// let cached = CachingInterceptor::new(Arc::new(registry), cache);
/// ```
#[derive(Clone, Default)]
pub struct ModelRegistry {
    providers: BTreeMap<String, Arc<dyn ModelProvider>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        ModelRegistry::default()
    }

    pub fn with_provider(mut self, model_id: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        self.register(model_id, provider);
        self
    }

    /// Register `provider` for `model_id`, replacing any previous one.
    pub fn register(&mut self, model_id: impl Into<String>, provider: Arc<dyn ModelProvider>) {
        let model_id = model_id.into();
        if self.providers.insert(model_id.clone(), provider).is_some() {
            debug!("Replaced provider for model '{}'", model_id);
        }
    }

    /// # Errors
    ///
    /// Returns `Error::ConfigError` if no provider is registered for
    /// `model_id`.
    pub fn resolve(&self, model_id: &str) -> Result<Arc<dyn ModelProvider>> {
        self.providers
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::ConfigError(format!("no provider registered for model '{}'", model_id)))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.providers.contains_key(model_id)
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl ModelProvider for ModelRegistry {
    async fn generate(&self, request: &InvocationRequest) -> Result<ModelResponse> {
        self.resolve(&request.model_id)?.generate(request).await
    }

    async fn stream(&self, request: &InvocationRequest) -> Result<ChunkStream> {
        self.resolve(&request.model_id)?.stream(request).await
    }
}
