//! One logical "ask": a bounded loop of provider round-trips with tool dispatch.

mod turn;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatMessage, StreamEvent, ToolCall, ToolTable, Usage};
use crate::config::ModelConfig;
use crate::error::ProviderError;
use crate::plugin::{PluginPipeline, RequestContext};
use crate::provider::{ChatCompletionRequest, ChatTransport};

use turn::TurnAccumulator;

/// Default upper bound on round-trips within one generation.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;

/// Receives events while a request is running.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: StreamEvent);
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    /// Provider answered 429
    TooManyRequests,
    /// Provider answered 500, 502 or 504
    ServiceError,
    Cancelled,
    UnknownError(String),
}

impl OutcomeKind {
    /// Whether a caller may reasonably try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OutcomeKind::TooManyRequests | OutcomeKind::ServiceError)
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, OutcomeKind::Success | OutcomeKind::Cancelled)
    }
}

/// Result of [`LlmRequestLoop::send`], always carrying partial progress.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    pub kind: OutcomeKind,
    /// Messages produced by this request, in order
    pub messages: Vec<ChatMessage>,
    /// Usage summed over every round-trip
    pub usage: Usage,
}

impl RequestOutcome {
    pub fn has_output(&self) -> bool {
        !self.messages.is_empty()
    }
}

/// Inputs of a single [`LlmRequestLoop::send`] call.
pub struct SendRequest<'a> {
    pub model: &'a ModelConfig,
    /// History up to and including the new user message
    pub messages: Vec<ChatMessage>,
    pub tools: &'a ToolTable,
    pub plugins: &'a PluginPipeline,
    pub stream: bool,
    pub cancel: CancellationToken,
}

enum Interrupted {
    Cancelled,
    Provider(ProviderError),
}

pub struct LlmRequestLoop {
    transport: Arc<dyn ChatTransport>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    max_tool_rounds: usize,
}

impl LlmRequestLoop {
    /// One semaphore per backing model; selectors sharing a backing model
    /// share the limit of the first one declared.
    pub fn new(transport: Arc<dyn ChatTransport>, models: &[ModelConfig]) -> Self {
        let mut semaphores = HashMap::new();
        for model in models {
            semaphores
                .entry(model.backing_model().to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(model.max_concurrency.max(1))));
        }
        Self {
            transport,
            semaphores,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    /// Run the request to completion. Never fails: every exit path returns
    /// the messages and usage produced so far.
    pub async fn send(&self, request: SendRequest<'_>, sink: &dyn EventSink) -> RequestOutcome {
        let mut messages = Vec::new();
        let mut usage = Usage::default();
        let kind = self.run(request, sink, &mut messages, &mut usage).await;
        match &kind {
            OutcomeKind::Success => {}
            OutcomeKind::UnknownError(cause) => log::warn!("request failed: {cause}"),
            other => log::debug!("request ended with {other:?}"),
        }
        RequestOutcome {
            kind,
            messages,
            usage,
        }
    }

    async fn run(
        &self,
        request: SendRequest<'_>,
        sink: &dyn EventSink,
        produced: &mut Vec<ChatMessage>,
        usage: &mut Usage,
    ) -> OutcomeKind {
        let cancel = request.cancel.clone();
        let _permit = match self.acquire(request.model, &cancel).await {
            Ok(permit) => permit,
            Err(kind) => return kind,
        };

        let tools = if request.model.supports_tools {
            request.tools.definitions()
        } else {
            Vec::new()
        };
        let mut ctx = RequestContext::new(request.model.clone(), request.messages, tools);
        if let Err(err) = request.plugins.before_loop(&mut ctx).await {
            return OutcomeKind::UnknownError(err.to_string());
        }

        for round in 0..self.max_tool_rounds {
            if cancel.is_cancelled() {
                return OutcomeKind::Cancelled;
            }
            ctx.round = round;
            if let Err(err) = request.plugins.before_request(&mut ctx).await {
                return OutcomeKind::UnknownError(err.to_string());
            }

            let wire = ChatCompletionRequest::new(
                ctx.model.backing_model(),
                &ctx.messages,
                request.stream,
            )
            .max_tokens(ctx.max_tokens)
            .tools(ctx.tools.clone());

            let mut turn = TurnAccumulator::default();
            let result = self
                .round_trip(&wire, request.stream, &mut turn, sink, &cancel)
                .await;

            if let Some(turn_usage) = turn.usage() {
                *usage += turn_usage;
            }
            let snapshot = turn.snapshot();
            let calls = snapshot.tool_calls.clone();
            if let Some(message) = turn.into_message(result.is_ok()) {
                ctx.messages.push(message.clone());
                produced.push(message);
            }
            match result {
                Ok(()) => {}
                Err(Interrupted::Cancelled) => return OutcomeKind::Cancelled,
                Err(Interrupted::Provider(err)) => return classify(&err),
            }

            ctx.last_response = Some(snapshot);
            if let Err(err) = request.plugins.after_response(&mut ctx).await {
                return OutcomeKind::UnknownError(err.to_string());
            }
            if calls.is_empty() {
                return OutcomeKind::Success;
            }

            let mut cancelled = false;
            for call in &calls {
                let results = if cancelled {
                    vec![tool_error(call, "cancelled")]
                } else {
                    match self
                        .invoke_tool(call, request.tools, sink, &cancel)
                        .await
                    {
                        Some(results) => results,
                        None => {
                            cancelled = true;
                            vec![tool_error(call, "cancelled")]
                        }
                    }
                };
                ctx.messages.extend(results.iter().cloned());
                produced.extend(results);
            }
            if cancelled {
                return OutcomeKind::Cancelled;
            }
        }

        OutcomeKind::UnknownError(format!(
            "tool loop exceeded {} rounds",
            self.max_tool_rounds
        ))
    }

    async fn acquire(
        &self,
        model: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, OutcomeKind> {
        let Some(semaphore) = self.semaphores.get(model.backing_model()) else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OutcomeKind::Cancelled),
            permit = Arc::clone(semaphore).acquire_owned() => permit
                .map(Some)
                .map_err(|_| OutcomeKind::UnknownError("model semaphore closed".to_string())),
        }
    }

    /// One provider call folded into `turn`. Cancellation is only observed
    /// while waiting on the provider; a delta already taken into `turn` is
    /// always delivered to the sink in full.
    async fn round_trip(
        &self,
        wire: &ChatCompletionRequest,
        stream: bool,
        turn: &mut TurnAccumulator,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        if stream {
            let mut frames = until_cancelled(cancel, self.transport.stream(wire))
                .await?
                .map_err(Interrupted::Provider)?;
            while let Some(frame) = until_cancelled(cancel, frames.next()).await? {
                let frame = frame.map_err(Interrupted::Provider)?;
                if let Some((content, reasoning)) = turn.apply_frame(frame) {
                    sink.emit(StreamEvent::MessageDelta { content, reasoning }).await;
                }
            }
        } else {
            let response = until_cancelled(cancel, self.transport.complete(wire))
                .await?
                .map_err(Interrupted::Provider)?;
            if let Some((content, reasoning)) = turn.apply_response(response) {
                sink.emit(StreamEvent::MessageDelta { content, reasoning }).await;
            }
        }
        Ok(())
    }

    /// Invoke one tool call; `None` when cancelled while the tool was running.
    async fn invoke_tool(
        &self,
        call: &ToolCall,
        tools: &ToolTable,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Option<Vec<ChatMessage>> {
        let tool = tools.get(&call.name);
        let rendered_args = match tool {
            Some(tool) => tool.render_arguments(&call.arguments),
            None => call.arguments.clone(),
        };
        sink.emit(StreamEvent::ToolCall {
            tool: call.clone(),
            rendered_args,
        })
        .await;

        let Some(tool) = tool else {
            log::warn!("model requested unknown tool `{}`", call.name);
            return Some(vec![tool_error(
                call,
                &format!("unknown tool `{}`", call.name),
            )]);
        };

        let raw = if call.arguments.trim().is_empty() {
            "{}"
        } else {
            call.arguments.as_str()
        };
        let arguments: Value = match serde_json::from_str(raw) {
            Ok(arguments) => arguments,
            Err(err) => {
                return Some(vec![tool_error(
                    call,
                    &format!("invalid JSON arguments for `{}`: {err}", call.name),
                )])
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = tool.invoke(arguments) => result,
        };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                log::debug!("tool `{}` failed: {err}", call.name);
                return Some(vec![tool_error(call, &err.to_string())]);
            }
        };

        let mut messages = vec![ChatMessage::tool(&call.id).content(output.content).build()];
        if let Some(showing) = output.showing {
            sink.emit(StreamEvent::ShowingTool {
                content: showing.content.clone(),
                kind: showing.kind.clone(),
            })
            .await;
            messages.push(
                ChatMessage::assistant()
                    .content(showing.content)
                    .showing(showing.kind)
                    .build(),
            );
        }
        Some(messages)
    }
}

async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        output = future => Ok(output),
    }
}

fn tool_error(call: &ToolCall, message: &str) -> ChatMessage {
    ChatMessage::tool(&call.id)
        .content(format!("Error: {message}"))
        .build()
}

/// Map a provider failure onto an outcome.
pub(crate) fn classify(err: &ProviderError) -> OutcomeKind {
    match err.status() {
        Some(429) => OutcomeKind::TooManyRequests,
        Some(500 | 502 | 504) => OutcomeKind::ServiceError,
        _ => OutcomeKind::UnknownError(err.to_string()),
    }
}
