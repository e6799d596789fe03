//! Invocation request and response shapes shared by providers and the cache.

use crate::error::Result;
use crate::strategy::CacheStrategy;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One message of the conversation sent upstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Sampling parameters forwarded to the provider.
///
/// These change the answer distribution, so they are part of the fingerprint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    pub stop_sequences: Vec<String>,
}

/// Per-call identifiers and cache behavior. Never part of the fingerprint.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestMetadata {
    /// Chat the call belongs to; used to tag savings records.
    pub chat_id: Option<String>,
    /// Message the call produces; used to tag savings records.
    pub message_id: Option<String>,
    pub strategy: CacheStrategy,
}

/// A model invocation: what gets fingerprinted and sent upstream.
///
/// # Example
///
/// ```
/// use llm_cache_kit::request::{InvocationRequest, Message};
///
/// let request = InvocationRequest::new("chat-model-large")
///     .with_system("Extract the invoice as JSON.")
///     .with_message(Message::user("Invoice #42 ..."))
///     .with_tools(["getWeather", "createDocument"]);
///
/// assert_eq!(request.messages.len(), 1);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InvocationRequest {
    pub model_id: String,
    /// Ordered conversation. Order is meaningful and preserved.
    pub messages: Vec<Message>,
    pub system: Option<String>,
    /// Active tool names. Order is incidental.
    pub active_tools: Vec<String>,
    pub sampling: SamplingParams,
    pub metadata: RequestMetadata,
}

impl InvocationRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        InvocationRequest {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Tag the call with the chat and message it belongs to.
    pub fn with_chat(mut self, chat_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        self.metadata.chat_id = Some(chat_id.into());
        self.metadata.message_id = Some(message_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.metadata.strategy = strategy;
        self
    }
}

/// Token counts reported by a model invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Usage {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A tool invocation requested by the model.
///
/// Arguments are kept as the raw JSON text the provider produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other,
}

/// A complete, non-streamed response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

impl ModelResponse {
    pub fn new(text: impl Into<String>, usage: Usage) -> Self {
        ModelResponse {
            text: text.into(),
            usage,
            ..Default::default()
        }
    }

    /// Assemble a response from a fully received chunk sequence.
    ///
    /// Returns `None` when the sequence carries no terminal `Finish` chunk.
    pub fn from_chunks(chunks: &[ResponseChunk]) -> Option<Self> {
        let mut response = ModelResponse::default();
        let mut finished = false;

        for chunk in chunks {
            match chunk {
                ResponseChunk::TextDelta(delta) => response.text.push_str(delta),
                ResponseChunk::ToolCall(call) => response.tool_calls.push(call.clone()),
                ResponseChunk::Finish {
                    usage,
                    finish_reason,
                } => {
                    response.usage = *usage;
                    response.finish_reason = *finish_reason;
                    finished = true;
                    break;
                }
            }
        }

        finished.then_some(response)
    }

    /// Synthesize a chunk sequence equivalent to this response.
    pub fn to_chunks(&self) -> Vec<ResponseChunk> {
        let mut chunks = Vec::with_capacity(self.tool_calls.len() + 2);
        if !self.text.is_empty() {
            chunks.push(ResponseChunk::TextDelta(self.text.clone()));
        }
        chunks.extend(self.tool_calls.iter().cloned().map(ResponseChunk::ToolCall));
        chunks.push(ResponseChunk::Finish {
            usage: self.usage,
            finish_reason: self.finish_reason,
        });
        chunks
    }
}

/// One increment of a streamed response. `Finish` is terminal and carries usage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseChunk {
    TextDelta(String),
    ToolCall(ToolCall),
    Finish {
        usage: Usage,
        finish_reason: FinishReason,
    },
}

impl ResponseChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseChunk::Finish { .. })
    }
}

/// Incremental response stream.
pub type ChunkStream = BoxStream<'static, Result<ResponseChunk>>;
