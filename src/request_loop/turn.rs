use crate::chat::{ChatMessage, ToolCall, Usage};
use crate::plugin::ResponseSnapshot;
use crate::provider::{ChatCompletionResponse, StreamResponse, ToolCallFragment};

/// Output of one provider round-trip, accumulated frame by frame.
#[derive(Debug, Default)]
pub(crate) struct TurnAccumulator {
    content: String,
    reasoning: String,
    calls: Vec<PendingCall>,
    /// Call that id-less fragments continue
    cursor: Option<usize>,
    usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

impl TurnAccumulator {
    /// Fold one streamed frame in; returns the text delta to emit, if any.
    pub(crate) fn apply_frame(&mut self, frame: StreamResponse) -> Option<(String, String)> {
        if let Some(usage) = frame.usage {
            self.merge_usage(usage);
        }
        let delta = frame.choices.into_iter().next()?.delta;
        for fragment in delta.tool_calls.iter().flatten() {
            self.apply_fragment(fragment);
        }
        self.push_text(
            delta.content.unwrap_or_default(),
            delta.reasoning_content.unwrap_or_default(),
        )
    }

    /// Fold a complete non-streaming response in.
    pub(crate) fn apply_response(
        &mut self,
        response: ChatCompletionResponse,
    ) -> Option<(String, String)> {
        if let Some(usage) = response.usage {
            self.merge_usage(usage);
        }
        let message = response.choices.into_iter().next()?.message;
        for fragment in message.tool_calls.iter().flatten() {
            self.apply_fragment(fragment);
        }
        self.push_text(
            message.content.unwrap_or_default(),
            message.reasoning_content.unwrap_or_default(),
        )
    }

    /// A fragment with an id opens or continues that call; one without an id
    /// continues the most recently seen call.
    pub(crate) fn apply_fragment(&mut self, fragment: &ToolCallFragment) {
        let idx = match fragment.id() {
            Some(id) => match self.calls.iter().position(|call| call.id == id) {
                Some(existing) => existing,
                None => self.open_call(id.to_string()),
            },
            None => match self.cursor {
                Some(current) => current,
                None => self.open_call(String::new()),
            },
        };
        self.cursor = Some(idx);

        let call = &mut self.calls[idx];
        if let Some(name) = fragment.name() {
            call.name.push_str(name);
        }
        if let Some(arguments) = fragment.arguments() {
            call.arguments.push_str(arguments);
        }
    }

    fn open_call(&mut self, id: String) -> usize {
        self.calls.push(PendingCall {
            id,
            ..PendingCall::default()
        });
        self.calls.len() - 1
    }

    fn push_text(&mut self, content: String, reasoning: String) -> Option<(String, String)> {
        if content.is_empty() && reasoning.is_empty() {
            return None;
        }
        self.content.push_str(&content);
        self.reasoning.push_str(&reasoning);
        Some((content, reasoning))
    }

    fn merge_usage(&mut self, usage: Usage) {
        self.usage = Some(Usage::merge_max(self.usage, usage));
    }

    pub(crate) fn usage(&self) -> Option<Usage> {
        self.usage
    }

    /// Reconstructed calls; calls that never received an id get `call_<n>`.
    pub(crate) fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .enumerate()
            .map(|(idx, call)| ToolCall {
                id: if call.id.is_empty() {
                    format!("call_{idx}")
                } else {
                    call.id.clone()
                },
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .collect()
    }

    pub(crate) fn snapshot(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            content: self.content.clone(),
            reasoning: self.reasoning.clone(),
            tool_calls: self.tool_calls(),
            usage: self.usage,
        }
    }

    /// The assistant message of this turn, or `None` if nothing was produced.
    ///
    /// Interrupted turns leave their tool calls out, since those calls will
    /// never receive results.
    pub(crate) fn into_message(self, include_calls: bool) -> Option<ChatMessage> {
        let calls = if include_calls {
            self.tool_calls()
        } else {
            Vec::new()
        };
        let message = ChatMessage::assistant()
            .content(self.content)
            .reasoning(self.reasoning)
            .tool_calls(calls)
            .build();
        (!message.is_empty()).then_some(message)
    }
}
