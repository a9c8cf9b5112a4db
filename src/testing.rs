//! Test doubles shared by the unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::chat::{ChatTool, ConversationId, StreamEvent, Tool, ToolError, ToolOutput, Usage};
use crate::error::ProviderError;
use crate::moderation::{ModerationError, Moderator};
use crate::provider::{
    ChatCompletionRequest, ChatCompletionResponse, ChatTransport, FrameStream, FunctionFragment,
    ResponseChoice, ResponseMessage, StreamChoice, StreamDelta, StreamResponse, ToolCallFragment,
};
use crate::request_loop::EventSink;

/// One scripted provider reply.
pub(crate) enum Step {
    Frames(Vec<Result<StreamResponse, ProviderError>>),
    /// Frames pushed by the test while the request is running
    Channel(mpsc::UnboundedReceiver<Result<StreamResponse, ProviderError>>),
    Response(ChatCompletionResponse),
    Error(ProviderError),
    /// Never answers
    Pending,
}

/// Transport that replays a script and records every request it receives.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().clone()
    }

    fn next(&self, request: &ChatCompletionRequest) -> Option<Step> {
        self.requests.lock().push(request.clone());
        self.script.lock().pop_front()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        match self.next(request) {
            Some(Step::Response(response)) => Ok(response),
            Some(Step::Error(err)) => Err(err),
            Some(Step::Pending) => futures::future::pending().await,
            Some(_) => Err(ProviderError::InvalidRequest(
                "scripted stream step for a non-streaming call".into(),
            )),
            None => Err(ProviderError::InvalidRequest("script exhausted".into())),
        }
    }

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<FrameStream, ProviderError> {
        match self.next(request) {
            Some(Step::Frames(frames)) => Ok(Box::pin(futures::stream::iter(frames))),
            Some(Step::Channel(rx)) => Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            }))),
            Some(Step::Error(err)) => Err(err),
            Some(Step::Pending) => futures::future::pending().await,
            Some(Step::Response(_)) => Err(ProviderError::InvalidRequest(
                "scripted response for a streaming call".into(),
            )),
            None => Err(ProviderError::InvalidRequest("script exhausted".into())),
        }
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn streamed_text(&self) -> String {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                StreamEvent::MessageDelta { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: StreamEvent) {
        self.events.lock().push(event);
    }
}

pub(crate) fn delta_frame(content: &str, reasoning: &str) -> StreamResponse {
    StreamResponse {
        choices: vec![StreamChoice {
            delta: StreamDelta {
                content: (!content.is_empty()).then(|| content.to_string()),
                reasoning_content: (!reasoning.is_empty()).then(|| reasoning.to_string()),
                tool_calls: None,
            },
        }],
        usage: None,
    }
}

pub(crate) fn content_frame(content: &str) -> StreamResponse {
    delta_frame(content, "")
}

pub(crate) fn tool_frame(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> StreamResponse {
    StreamResponse {
        choices: vec![StreamChoice {
            delta: StreamDelta {
                content: None,
                reasoning_content: None,
                tool_calls: Some(vec![fragment(id, name, arguments)]),
            },
        }],
        usage: None,
    }
}

pub(crate) fn usage_frame(prompt: u32, completion: u32, total: u32) -> StreamResponse {
    StreamResponse {
        choices: Vec::new(),
        usage: Some(Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
        }),
    }
}

pub(crate) fn fragment(id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> ToolCallFragment {
    ToolCallFragment {
        index: Some(0),
        id: id.map(str::to_string),
        function: Some(FunctionFragment {
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }),
    }
}

pub(crate) fn text_response(content: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        choices: vec![ResponseChoice {
            message: ResponseMessage {
                content: Some(content.to_string()),
                reasoning_content: None,
                tool_calls: None,
            },
        }],
        usage: Some(Usage::new(10, 2)),
    }
}

pub(crate) fn tool_response(id: &str, name: &str, arguments: &str) -> ChatCompletionResponse {
    ChatCompletionResponse {
        choices: vec![ResponseChoice {
            message: ResponseMessage {
                content: None,
                reasoning_content: None,
                tool_calls: Some(vec![fragment(Some(id), Some(name), Some(arguments))]),
            },
        }],
        usage: Some(Usage::new(10, 5)),
    }
}

pub(crate) fn status_error(status: u16) -> ProviderError {
    ProviderError::Status {
        status,
        body: format!("status {status}"),
    }
}

/// Adds the integer fields `a` and `b`.
pub(crate) struct SumTool;

#[async_trait]
impl ChatTool for SumTool {
    fn name(&self) -> &str {
        "sum"
    }

    fn definition(&self) -> Tool {
        Tool::function(
            "sum",
            "Add two integers",
            serde_json::json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            }),
        )
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let field = |name: &str| {
            arguments
                .get(name)
                .and_then(Value::as_i64)
                .ok_or_else(|| ToolError::InvalidArguments(format!("missing integer `{name}`")))
        };
        Ok(ToolOutput::text((field("a")? + field("b")?).to_string()))
    }
}

/// Returns display-only content alongside its result.
pub(crate) struct ChartTool;

#[async_trait]
impl ChatTool for ChartTool {
    fn name(&self) -> &str {
        "chart"
    }

    fn definition(&self) -> Tool {
        Tool::function("chart", "Render a chart", serde_json::json!({"type": "object"}))
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::text("chart rendered").with_showing("<svg/>", "chart"))
    }
}

/// Always fails.
pub(crate) struct BrokenTool;

#[async_trait]
impl ChatTool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn definition(&self) -> Tool {
        Tool::function("broken", "Always fails", serde_json::json!({"type": "object"}))
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        Err(ToolError::Execution("disk on fire".into()))
    }
}

/// Never returns.
pub(crate) struct StuckTool;

#[async_trait]
impl ChatTool for StuckTool {
    fn name(&self) -> &str {
        "stuck"
    }

    fn definition(&self) -> Tool {
        Tool::function("stuck", "Never returns", serde_json::json!({"type": "object"}))
    }

    async fn invoke(&self, _arguments: Value) -> Result<ToolOutput, ToolError> {
        futures::future::pending().await
    }
}

/// Flags any suffix containing `word` and records what it was asked.
pub(crate) struct FlagModerator {
    word: String,
    calls: Mutex<Vec<(String, String)>>,
}

impl FlagModerator {
    pub(crate) fn new(word: &str) -> Self {
        Self {
            word: word.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(prior, suffix)` of every check, in call order.
    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Moderator for FlagModerator {
    async fn check(
        &self,
        _conversation_id: ConversationId,
        prior: &str,
        suffix: &str,
    ) -> Result<bool, ModerationError> {
        self.calls
            .lock()
            .push((prior.to_string(), suffix.to_string()));
        Ok(suffix.contains(&self.word))
    }
}

pub(crate) fn create_mock_response(chunks: Vec<Result<Bytes, reqwest::Error>>) -> reqwest::Response {
    use http_body_util::StreamBody;
    use reqwest::Body;

    let frame_stream = futures::stream::iter(
        chunks
            .into_iter()
            .map(|chunk| chunk.map(hyper::body::Frame::data)),
    );

    let body = StreamBody::new(frame_stream);
    let body = Body::wrap(body);

    let http_response = http::Response::builder().status(200).body(body).unwrap();

    http_response.into()
}
