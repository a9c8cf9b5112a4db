//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! [provider]
//! base_url = "https://api.openai.com/v1/"
//! api_key_env = "OPENAI_API_KEY"
//!
//! [[models]]
//! id = "default"
//! model = "gpt-4o-mini"
//! max_concurrency = 4
//!
//! [moderation]
//! enabled = true
//! model = "gpt-4o-mini"
//! ```

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: ProviderConfig,
    pub models: Vec<ModelConfig>,
    pub moderation: ModerationConfig,
    pub retry: ResilienceConfig,
    pub limits: LimitsConfig,
}

impl EngineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.id.is_empty() || model.model.is_empty() {
                return Err(ConfigError::Invalid(
                    "every model needs a non-empty id and model".to_string(),
                ));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model id `{}`",
                    model.id
                )));
            }
            if model.max_concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model `{}` has max_concurrency = 0",
                    model.id
                )));
            }
        }
        if self.moderation.enabled && self.moderation.threshold == 0 {
            return Err(ConfigError::Invalid(
                "moderation threshold must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Find a model by its selector id.
    pub fn model(&self, selector: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|model| model.id == selector)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Environment variable consulted when `api_key` is not set
    pub api_key_env: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Use SSE streaming for generations
    pub stream: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/".to_string(),
            api_key: None,
            api_key_env: None,
            timeout_seconds: Some(60),
            stream: true,
        }
    }
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.expose_secret().clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// A model selectable by callers, mapped onto a provider model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Selector used by callers of `start_generation`
    pub id: String,
    /// Model name sent to the provider
    pub model: String,
    /// Concurrent outbound calls allowed per backing model
    pub max_concurrency: usize,
    pub max_tokens: Option<u32>,
    /// Accepts image parts directly
    pub multimodal: bool,
    pub supports_tools: bool,
    /// System prompt seeded before the first round-trip
    pub system: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            model: String::new(),
            max_concurrency: 4,
            max_tokens: None,
            multimodal: false,
            supports_tools: true,
            system: None,
        }
    }
}

impl ModelConfig {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    /// Key of the per-model concurrency limit; several selectors may share it.
    pub fn backing_model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    /// Model asked to classify content
    pub model: Option<String>,
    /// Unchecked bytes of content that trigger an incremental check
    pub threshold: usize,
    /// Text persisted in place of a banned response
    pub replacement: String,
    /// Bytes of already-checked content sent along as context
    pub context_chars: usize,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: None,
            threshold: 1000,
            replacement: "This response was removed because it violated the content policy."
                .to_string(),
            context_chars: 500,
        }
    }
}

/// Configuration for retry and backoff behavior.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Maximum number of attempts including the first one
    pub max_attempts: usize,
    /// Initial backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_delay_ms: u64,
    /// Whether to add jitter to backoff delays
    pub jitter: bool,
}

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 200;
const DEFAULT_MAX_DELAY_MS: u64 = 2_000;

impl ResilienceConfig {
    /// Creates a default configuration with sane values.
    pub fn defaults() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }

    /// A single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::defaults()
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Upper bound on provider round-trips within one generation
    pub max_tool_rounds: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { max_tool_rounds: 8 }
    }
}
