mod id;
mod message;
mod sse;
mod stream;
mod tool;
mod usage;

pub use id::ConversationId;
pub use message::{ChatMessage, ChatMessageBuilder, ChatRole, ContentPart, SHOWING_ERROR};
pub use stream::StreamEvent;
pub use tool::{
    ChatTool, FunctionTool, ShowingContent, Tool, ToolCall, ToolError, ToolOutput, ToolTable,
};
pub use usage::Usage;

pub(crate) use sse::create_sse_stream;
