//! Request and response bodies of the OpenAI-compatible chat completions API.

use serde::{Deserialize, Serialize};

use crate::chat::{ChatMessage, ChatRole, ContentPart, Tool, ToolCall, Usage};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: &[ChatMessage], stream: bool) -> Self {
        Self {
            model: model.into(),
            messages: build_wire_messages(messages),
            stream,
            max_tokens: None,
            tools: None,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    pub fn max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Attach tool definitions; an empty list is left out of the body.
    pub fn tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = (!tools.is_empty()).then_some(tools);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: &'static str,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Convert stored history into the outbound message list.
///
/// Messages before the latest context compression are replaced by it, except
/// system prompts. Display-only messages are left out.
pub fn build_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    let start = messages
        .iter()
        .rposition(|msg| msg.role == ChatRole::ContextCompression)
        .unwrap_or(0);

    messages
        .iter()
        .enumerate()
        .filter(|(idx, msg)| *idx >= start || msg.role == ChatRole::System)
        .map(|(_, msg)| msg)
        .filter(|msg| !msg.is_showing())
        .map(to_wire_message)
        .collect()
}

fn to_wire_message(msg: &ChatMessage) -> WireMessage {
    let tool_calls = (!msg.tool_calls.is_empty()).then(|| {
        msg.tool_calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                call_type: "function",
                function: WireFunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect()
    });

    WireMessage {
        role: msg.role.wire_name(),
        content: wire_content(&msg.content),
        tool_calls,
        tool_call_id: msg.tool_call_id.clone(),
    }
}

fn wire_content(parts: &[ContentPart]) -> Option<WireContent> {
    let has_images = parts
        .iter()
        .any(|part| matches!(part, ContentPart::Image { .. }));

    if has_images {
        let parts = parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => WirePart::Text { text: text.clone() },
                ContentPart::Image { url } => WirePart::ImageUrl {
                    image_url: ImageUrl { url: url.clone() },
                },
                ContentPart::File { name, url } => WirePart::Text {
                    text: file_reference(name, url),
                },
            })
            .collect();
        return Some(WireContent::Parts(parts));
    }

    let text: String = parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => text.clone(),
            ContentPart::File { name, url } => file_reference(name, url),
            ContentPart::Image { .. } => String::new(),
        })
        .collect::<Vec<_>>()
        .join("");
    (!text.is_empty()).then_some(WireContent::Text(text))
}

fn file_reference(name: &str, url: &str) -> String {
    format!("\n[file: {name}]({url})\n")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ResponseChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseChoice {
    pub message: ResponseMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

/// One `data:` frame of a streamed completion.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamResponse {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallFragment>>,
}

/// A possibly partial tool call; streamed calls arrive split over many frames.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolCallFragment {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionFragment>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FunctionFragment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ToolCallFragment {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.function.as_ref().and_then(|f| f.name.as_deref())
    }

    pub fn arguments(&self) -> Option<&str> {
        self.function.as_ref().and_then(|f| f.arguments.as_deref())
    }
}

impl From<&ToolCall> for ToolCallFragment {
    fn from(call: &ToolCall) -> Self {
        Self {
            index: None,
            id: Some(call.id.clone()),
            function: Some(FunctionFragment {
                name: Some(call.name.clone()),
                arguments: Some(call.arguments.clone()),
            }),
        }
    }
}
