//! One chat turn end to end.
//!
//! [`ChatService`] saves the chat and the user message, calls the model
//! through whatever [`ModelProvider`] it was given (normally a
//! [`CachingInterceptor`](crate::interceptor::CachingInterceptor)), and once
//! the full response exists hands it to the [`AccountingPipeline`] on a
//! detached task. Persistence never fails the turn: the caller gets the model
//! response whether or not any record could be written.

use crate::error::{Error, Result};
use crate::model::{Chat, ChatMessage};
use crate::persistence::PersistenceGateway;
use crate::pipeline::{AccountingPipeline, PipelineReport, TurnOutput};
use crate::provider::ModelProvider;
use crate::request::{ChunkStream, InvocationRequest, ModelResponse, ResponseChunk, Role};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 80;

/// Receives the accounting report once the background task finishes.
pub struct AccountingHandle {
    rx: oneshot::Receiver<PipelineReport>,
}

impl AccountingHandle {
    /// `None` if accounting never ran (stream dropped before its terminal
    /// chunk, or no runtime to run it on).
    pub async fn wait(self) -> Option<PipelineReport> {
        self.rx.await.ok()
    }
}

/// Result of a non-streamed turn.
pub struct ChatReply {
    pub message_id: String,
    pub response: ModelResponse,
    pub accounting: AccountingHandle,
}

/// Result of a streamed turn.
pub struct ChatStream {
    pub message_id: String,
    pub chunks: ChunkStream,
    pub accounting: AccountingHandle,
}

pub struct ChatService {
    provider: Arc<dyn ModelProvider>,
    pipeline: Arc<AccountingPipeline>,
}

impl ChatService {
    pub fn new(provider: Arc<dyn ModelProvider>, pipeline: Arc<AccountingPipeline>) -> Self {
        ChatService { provider, pipeline }
    }

    fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        self.pipeline.gateway()
    }

    /// Run a turn and wait for the full response.
    ///
    /// # Errors
    ///
    /// Returns `Error::ValidationError` if the request has no chat id, and
    /// upstream errors unchanged.
    pub async fn generate(&self, user_id: &str, mut request: InvocationRequest) -> Result<ChatReply> {
        let (chat_id, message_id) = self.prepare(user_id, &mut request).await?;
        let response = self.provider.generate(&request).await?;

        let (tx, rx) = oneshot::channel();
        match Handle::try_current() {
            Ok(handle) => {
                spawn_accounting(
                    &handle,
                    Arc::clone(&self.pipeline),
                    Finished {
                        chat_id,
                        message_id: message_id.clone(),
                        model_id: request.model_id.clone(),
                        response: response.clone(),
                    },
                    tx,
                );
            }
            Err(_) => warn!("No async runtime; skipping accounting for chat {}", chat_id),
        }

        Ok(ChatReply {
            message_id,
            response,
            accounting: AccountingHandle { rx },
        })
    }

    /// Run a turn as a stream. Accounting starts once the terminal chunk
    /// has been delivered; a stream dropped earlier is never accounted.
    ///
    /// # Errors
    ///
    /// Same as [`ChatService::generate`].
    pub async fn stream(&self, user_id: &str, mut request: InvocationRequest) -> Result<ChatStream> {
        let (chat_id, message_id) = self.prepare(user_id, &mut request).await?;
        let upstream = self.provider.stream(&request).await?;

        let (tx, rx) = oneshot::channel();
        let chunks = AccountingStream {
            upstream,
            chunks: Vec::new(),
            pending: Some(Pending {
                handle: Handle::try_current().ok(),
                pipeline: Arc::clone(&self.pipeline),
                chat_id,
                message_id: message_id.clone(),
                model_id: request.model_id.clone(),
                tx,
            }),
        }
        .boxed();

        Ok(ChatStream {
            message_id,
            chunks,
            accounting: AccountingHandle { rx },
        })
    }

    /// Save the chat (if new) and the user message; tag the request with
    /// the chat and the assistant message id.
    async fn prepare(&self, user_id: &str, request: &mut InvocationRequest) -> Result<(String, String)> {
        let chat_id = request
            .metadata
            .chat_id
            .clone()
            .ok_or_else(|| Error::validation("chat_id", "a chat turn needs a chat id"))?;
        let message_id = request
            .metadata
            .message_id
            .get_or_insert_with(|| Uuid::now_v7().to_string())
            .clone();

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone());

        match self.gateway().get_chat_by_id(&chat_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let title = title_from(last_user.as_deref().unwrap_or_default());
                if let Err(e) = self.gateway().save_chat(Chat::new(&chat_id, user_id, title)).await {
                    error!("Failed to save chat {}: {}", chat_id, e);
                }
            }
            Err(e) => error!("Failed to load chat {}: {}", chat_id, e),
        }

        if let Some(content) = last_user {
            let message = ChatMessage::new(Uuid::now_v7().to_string(), &chat_id, Role::User, content);
            if let Err(e) = self.gateway().save_messages(vec![message]).await {
                error!("Failed to save user message for chat {}: {}", chat_id, e);
            }
        }

        Ok((chat_id, message_id))
    }
}

fn title_from(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        return "New chat".to_string();
    }
    line.chars().take(TITLE_MAX_CHARS).collect()
}

struct Finished {
    chat_id: String,
    message_id: String,
    model_id: String,
    response: ModelResponse,
}

fn spawn_accounting(
    handle: &Handle,
    pipeline: Arc<AccountingPipeline>,
    finished: Finished,
    tx: oneshot::Sender<PipelineReport>,
) {
    handle.spawn(async move {
        let message = ChatMessage::new(
            &finished.message_id,
            &finished.chat_id,
            Role::Assistant,
            finished.response.text.clone(),
        );
        if let Err(e) = pipeline.gateway().save_messages(vec![message]).await {
            error!(
                "Failed to save assistant message for chat {}: {}",
                finished.chat_id, e
            );
        }

        let report = pipeline
            .process(TurnOutput::new(finished.model_id, &finished.response))
            .await;
        // The caller may have stopped listening.
        let _ = tx.send(report);
    });
}

struct Pending {
    handle: Option<Handle>,
    pipeline: Arc<AccountingPipeline>,
    chat_id: String,
    message_id: String,
    model_id: String,
    tx: oneshot::Sender<PipelineReport>,
}

/// Passes chunks through and starts accounting at the terminal chunk.
struct AccountingStream {
    upstream: ChunkStream,
    chunks: Vec<ResponseChunk>,
    pending: Option<Pending>,
}

impl AccountingStream {
    fn start_accounting(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let Some(response) = ModelResponse::from_chunks(&std::mem::take(&mut self.chunks)) else {
            return;
        };
        let Some(handle) = pending.handle else {
            warn!(
                "No async runtime; skipping accounting for chat {}",
                pending.chat_id
            );
            return;
        };
        spawn_accounting(
            &handle,
            pending.pipeline,
            Finished {
                chat_id: pending.chat_id,
                message_id: pending.message_id,
                model_id: pending.model_id,
                response,
            },
            pending.tx,
        );
    }
}

impl Stream for AccountingStream {
    type Item = Result<ResponseChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let polled = this.upstream.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) if this.pending.is_some() => {
                this.chunks.push(chunk.clone());
                if chunk.is_terminal() {
                    this.start_accounting();
                }
            }
            Poll::Ready(Some(Err(e))) if this.pending.is_some() => {
                warn!("Chat stream failed; turn will not be accounted: {}", e);
                this.pending = None;
                this.chunks.clear();
            }
            _ => {}
        }
        polled
    }
}
