//! Incremental content moderation of streamed assistant output.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::chat::{ChatMessage, ConversationId};
use crate::config::ModerationConfig;
use crate::error::ProviderError;
use crate::provider::{ChatCompletionRequest, ChatTransport};

#[derive(Debug, thiserror::Error)]
pub enum ModerationError {
    #[error("moderation request failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("malformed moderation verdict: {0}")]
    Malformed(String),
}

/// Classifies a new piece of generated text.
#[async_trait]
pub trait Moderator: Send + Sync {
    /// Returns true when `suffix` must be banned. `prior` is the already
    /// checked text preceding it, for context.
    async fn check(
        &self,
        conversation_id: ConversationId,
        prior: &str,
        suffix: &str,
    ) -> Result<bool, ModerationError>;
}

/// Moderation settings shared by every session of an orchestrator.
#[derive(Clone)]
pub struct ModerationPipeline {
    moderator: Option<Arc<dyn Moderator>>,
    threshold: usize,
    replacement: String,
}

impl ModerationPipeline {
    pub fn disabled() -> Self {
        let defaults = ModerationConfig::default();
        Self {
            moderator: None,
            threshold: defaults.threshold,
            replacement: defaults.replacement,
        }
    }

    pub fn new(moderator: Arc<dyn Moderator>, config: &ModerationConfig) -> Self {
        Self {
            moderator: Some(moderator),
            threshold: config.threshold.max(1),
            replacement: config.replacement.clone(),
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.moderator.is_some()
    }

    /// Unchecked bytes that trigger an incremental check.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Text persisted in place of a banned response.
    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    /// Returns true when the suffix is flagged. Moderator failures are
    /// logged and treated as not flagged.
    pub async fn check(&self, conversation_id: ConversationId, prior: &str, suffix: &str) -> bool {
        let Some(moderator) = &self.moderator else {
            return false;
        };
        if suffix.is_empty() {
            return false;
        }
        match moderator.check(conversation_id, prior, suffix).await {
            Ok(flagged) => {
                if flagged {
                    log::info!("conversation {conversation_id}: content flagged by moderation");
                }
                flagged
            }
            Err(err) => {
                log::warn!("conversation {conversation_id}: moderation check failed: {err}");
                false
            }
        }
    }
}

impl Default for ModerationPipeline {
    fn default() -> Self {
        Self::disabled()
    }
}

const MODERATION_PROMPT: &str = "You are a content moderation classifier. \
Decide whether the NEW TEXT written by an AI assistant violates content policy \
(sexual content involving minors, instructions for serious harm, hate speech, \
harassment). The CONTEXT is earlier text of the same answer and was already \
approved. Reply with JSON only: {\"flagged\": true} or {\"flagged\": false}.";

#[derive(Debug, Deserialize)]
struct Verdict {
    flagged: bool,
}

/// [`Moderator`] that asks a chat model for a verdict.
pub struct LlmModerator {
    transport: Arc<dyn ChatTransport>,
    model: String,
    context_chars: usize,
}

impl LlmModerator {
    pub fn new(transport: Arc<dyn ChatTransport>, model: impl Into<String>) -> Self {
        Self {
            transport,
            model: model.into(),
            context_chars: ModerationConfig::default().context_chars,
        }
    }

    pub fn context_chars(mut self, context_chars: usize) -> Self {
        self.context_chars = context_chars;
        self
    }

    fn request(&self, prior: &str, suffix: &str) -> ChatCompletionRequest {
        let context = tail(prior, self.context_chars);
        let messages = vec![
            ChatMessage::system().content(MODERATION_PROMPT).build(),
            ChatMessage::user()
                .content(format!("CONTEXT:\n{context}\n\nNEW TEXT:\n{suffix}"))
                .build(),
        ];
        ChatCompletionRequest::new(self.model.clone(), &messages, false)
    }
}

#[async_trait]
impl Moderator for LlmModerator {
    async fn check(
        &self,
        _conversation_id: ConversationId,
        prior: &str,
        suffix: &str,
    ) -> Result<bool, ModerationError> {
        let response = self.transport.complete(&self.request(prior, suffix)).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        parse_verdict(&content)
    }
}

fn parse_verdict(content: &str) -> Result<bool, ModerationError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str::<Verdict>(body)
        .map(|verdict| verdict.flagged)
        .map_err(|_| ModerationError::Malformed(content.to_string()))
}

/// At most the last `max_bytes` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
