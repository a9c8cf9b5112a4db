use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Plugin, PluginError, RequestContext};
use crate::chat::{ChatMessage, ChatRole, ContentPart};

/// Seeds a system prompt at the head of the conversation.
///
/// Nothing is inserted when the history already opens with a system message.
pub struct SystemPromptPlugin {
    prompt: Option<String>,
}

impl SystemPromptPlugin {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
        }
    }

    /// Use the `system` prompt of the selected model, if configured.
    pub fn from_model() -> Self {
        Self { prompt: None }
    }
}

#[async_trait]
impl Plugin for SystemPromptPlugin {
    fn name(&self) -> &str {
        "system_prompt"
    }

    async fn before_loop(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        let Some(prompt) = self.prompt.clone().or_else(|| ctx.model.system.clone()) else {
            return Ok(());
        };
        if prompt.is_empty() {
            return Ok(());
        }
        let has_system = ctx
            .messages
            .first()
            .is_some_and(|msg| msg.role == ChatRole::System);
        if !has_system {
            ctx.messages
                .insert(0, ChatMessage::system().content(prompt).build());
        }
        Ok(())
    }
}

/// Produces a text description of an image.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    async fn describe(&self, url: &str) -> Result<String, PluginError>;
}

/// Replaces image parts with text for models that cannot read images.
pub struct ImageFlattenPlugin {
    describer: Option<Arc<dyn ImageDescriber>>,
    cache: Mutex<HashMap<String, String>>,
}

impl ImageFlattenPlugin {
    /// Images become a bare `[image: url]` reference.
    pub fn new() -> Self {
        Self {
            describer: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_describer(describer: Arc<dyn ImageDescriber>) -> Self {
        Self {
            describer: Some(describer),
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn replacement(&self, url: &str) -> String {
        let Some(describer) = &self.describer else {
            return format!("[image: {url}]");
        };
        let cached = self.cache.lock().get(url).cloned();
        if let Some(cached) = cached {
            return format!("[image: {cached}]");
        }
        match describer.describe(url).await {
            Ok(description) => {
                self.cache
                    .lock()
                    .insert(url.to_string(), description.clone());
                format!("[image: {description}]")
            }
            Err(err) => {
                log::warn!("describing image {url} failed: {err}");
                format!("[image: {url}]")
            }
        }
    }
}

impl Default for ImageFlattenPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ImageFlattenPlugin {
    fn name(&self) -> &str {
        "image_flatten"
    }

    async fn before_request(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        if ctx.model.multimodal {
            return Ok(());
        }
        for message in ctx.messages.iter_mut().filter(|msg| msg.has_images()) {
            for part in message.content.iter_mut() {
                if let ContentPart::Image { url } = part {
                    let text = self.replacement(url).await;
                    *part = ContentPart::Text { text };
                }
            }
        }
        Ok(())
    }
}

/// Logs what the provider returned after every round-trip.
#[derive(Debug, Default)]
pub struct ResponseLogPlugin;

#[async_trait]
impl Plugin for ResponseLogPlugin {
    fn name(&self) -> &str {
        "response_log"
    }

    async fn after_response(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        let Some(response) = &ctx.last_response else {
            return Ok(());
        };
        let calls: Vec<&str> = response
            .tool_calls
            .iter()
            .map(|call| call.name.as_str())
            .collect();
        log::debug!(
            "{} round {}: {} content bytes, tool calls {:?}, usage {:?}",
            ctx.model.backing_model(),
            ctx.round,
            response.content.len(),
            calls,
            response.usage
        );
        Ok(())
    }
}
