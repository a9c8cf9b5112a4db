use super::tool::ToolCall;

/// Event pushed to the listeners of a live generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental assistant output
    MessageDelta {
        content: String,
        reasoning: String,
    },
    /// The model requested a tool call; arguments are rendered for display
    ToolCall {
        tool: ToolCall,
        rendered_args: String,
    },
    /// Display-only content produced by a tool
    ShowingTool { content: String, kind: String },
    /// The conversation was banned by moderation; no further events follow
    Banned,
    /// The generation ended normally; no further events follow
    Finished,
}

impl StreamEvent {
    /// Returns true for events after which a listener receives nothing more.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Banned | StreamEvent::Finished)
    }
}
