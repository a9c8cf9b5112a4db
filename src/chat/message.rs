use serde::{Deserialize, Serialize};

use super::tool::ToolCall;

/// Showing type of the notice persisted when a generation fails without output.
pub const SHOWING_ERROR: &str = "error";

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// The user/human participant in the conversation
    User,
    /// Instructions for the model
    System,
    /// The AI assistant participant in the conversation
    Assistant,
    /// Result of a tool invocation, answering one assistant tool call
    Tool,
    /// Summary standing in for every message before it
    ContextCompression,
}

impl ChatRole {
    /// Role name on the provider wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::System | ChatRole::ContextCompression => "system",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

/// One ordered piece of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Reference to an image stored elsewhere
    Image { url: String },
    /// Reference to a file stored elsewhere
    File { name: String, url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of who sent this message
    pub role: ChatRole,
    /// Ordered content parts
    pub content: Vec<ContentPart>,
    /// Reasoning text produced alongside the content, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The call answered by a tool message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Marks synthetic messages that are displayed but never sent back to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub showing_type: Option<String>,
}

impl ChatMessage {
    /// Create a new builder for a user message
    pub fn user() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::User)
    }

    /// Create a new builder for a system message
    pub fn system() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::System)
    }

    /// Create a new builder for an assistant message
    pub fn assistant() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::Assistant)
    }

    /// Create a new builder for a tool result answering `call_id`
    pub fn tool(call_id: impl Into<String>) -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::Tool).tool_call_id(call_id)
    }

    /// Create a new builder for a context compression summary
    pub fn context_compression() -> ChatMessageBuilder {
        ChatMessageBuilder::new(ChatRole::ContextCompression)
    }

    /// Concatenation of every text part.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether this message is display-only and must stay out of outbound requests.
    pub fn is_showing(&self) -> bool {
        self.showing_type.is_some()
    }

    pub fn has_images(&self) -> bool {
        self.content
            .iter()
            .any(|part| matches!(part, ContentPart::Image { .. }))
    }

    /// True when the message carries neither text, other parts, reasoning nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
            && !self
                .content
                .iter()
                .any(|part| !matches!(part, ContentPart::Text { .. }))
            && self.reasoning.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.is_empty()
    }
}

/// Builder for ChatMessage
#[derive(Debug)]
pub struct ChatMessageBuilder {
    role: ChatRole,
    content: Vec<ContentPart>,
    reasoning: Option<String>,
    tool_calls: Vec<ToolCall>,
    tool_call_id: Option<String>,
    showing_type: Option<String>,
}

impl ChatMessageBuilder {
    /// Create a new ChatMessageBuilder with specified role
    pub fn new(role: ChatRole) -> Self {
        Self {
            role,
            content: Vec::new(),
            reasoning: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            showing_type: None,
        }
    }

    /// Append a text part; empty text is skipped
    pub fn content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        if !content.is_empty() {
            self.content.push(ContentPart::Text { text: content });
        }
        self
    }

    /// Append an image reference
    pub fn image_url(mut self, url: impl Into<String>) -> Self {
        self.content.push(ContentPart::Image { url: url.into() });
        self
    }

    /// Append a file reference
    pub fn file(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.content.push(ContentPart::File {
            name: name.into(),
            url: url.into(),
        });
        self
    }

    /// Set the reasoning text; empty reasoning is stored as none
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        let reasoning = reasoning.into();
        self.reasoning = (!reasoning.is_empty()).then_some(reasoning);
        self
    }

    /// Set the requested tool calls
    pub fn tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// Set the id of the call a tool message answers
    pub fn tool_call_id(mut self, id: impl Into<String>) -> Self {
        self.tool_call_id = Some(id.into());
        self
    }

    /// Mark the message as display-only with the given showing type
    pub fn showing(mut self, kind: impl Into<String>) -> Self {
        self.showing_type = Some(kind.into());
        self
    }

    /// Build the ChatMessage
    pub fn build(self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
            tool_call_id: self.tool_call_id,
            showing_type: self.showing_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_joins_text_parts_only() {
        let msg = ChatMessage::user()
            .content("look at ")
            .image_url("https://img.example/cat.png")
            .content("this")
            .build();

        assert_eq!(msg.text(), "look at this");
        assert!(msg.has_images());
        assert_eq!(msg.content.len(), 3);
    }

    #[test]
    fn showing_marks_message_as_display_only() {
        let msg = ChatMessage::assistant()
            .content("rendered chart")
            .showing("chart")
            .build();

        assert!(msg.is_showing());
        assert_eq!(msg.showing_type.as_deref(), Some("chart"));
    }

    #[test]
    fn empty_content_and_reasoning_are_skipped() {
        let msg = ChatMessage::assistant().content("").reasoning("").build();

        assert!(msg.content.is_empty());
        assert!(msg.reasoning.is_none());
        assert!(msg.is_empty());
    }

    #[test]
    fn tool_builder_sets_call_id() {
        let msg = ChatMessage::tool("call_1").content("42").build();

        assert_eq!(msg.role, ChatRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(!msg.is_empty());
    }

    #[test]
    fn context_compression_goes_out_as_system() {
        assert_eq!(ChatRole::ContextCompression.wire_name(), "system");
        assert_eq!(ChatRole::Tool.wire_name(), "tool");
    }
}
