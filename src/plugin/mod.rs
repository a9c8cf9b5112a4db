//! Ordered request hooks around each provider round-trip.

mod builtin;

use std::sync::Arc;

use async_trait::async_trait;

use crate::chat::{ChatMessage, Tool, ToolCall, Usage};
use crate::config::ModelConfig;

pub use builtin::{ImageDescriber, ImageFlattenPlugin, ResponseLogPlugin, SystemPromptPlugin};

/// Mutable state threaded through every hook of one generation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub model: ModelConfig,
    /// Outbound history for the next round-trip
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Tool>,
    pub max_tokens: Option<u32>,
    /// Zero-based round-trip counter
    pub round: usize,
    /// What the provider returned in the latest round-trip
    pub last_response: Option<ResponseSnapshot>,
}

impl RequestContext {
    pub fn new(model: ModelConfig, messages: Vec<ChatMessage>, tools: Vec<Tool>) -> Self {
        let max_tokens = model.max_tokens;
        Self {
            model,
            messages,
            tools,
            max_tokens,
            round: 0,
            last_response: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSnapshot {
    pub content: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
}

#[derive(Debug, thiserror::Error)]
#[error("plugin `{plugin}` failed: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Hook points of the request loop. Every hook defaults to a no-op.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Once, before the first round-trip.
    async fn before_loop(&self, _ctx: &mut RequestContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Before every round-trip; may rewrite the outbound messages.
    async fn before_request(&self, _ctx: &mut RequestContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// After every parsed response, with `last_response` filled in.
    async fn after_response(&self, _ctx: &mut RequestContext) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Plugins run in registration order; the first error stops the stage.
#[derive(Clone, Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.push(plugin);
        self
    }

    pub fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    pub async fn before_loop(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.before_loop(ctx).await?;
        }
        Ok(())
    }

    pub async fn before_request(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.before_request(ctx).await?;
        }
        Ok(())
    }

    pub async fn after_response(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.after_response(ctx).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("plugins", &self.names())
            .finish()
    }
}
