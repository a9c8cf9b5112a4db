//! Entry point of the engine: admits generations and wires sessions to the
//! request loop.

mod retry;

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::chat::{ChatMessage, ChatTool, ConversationId, StreamEvent, ToolTable, SHOWING_ERROR};
use crate::config::{EngineConfig, ModelConfig, ResilienceConfig};
use crate::moderation::{LlmModerator, ModerationPipeline};
use crate::plugin::{ImageFlattenPlugin, PluginPipeline, ResponseLogPlugin, SystemPromptPlugin};
use crate::provider::{ChatTransport, ProviderClient};
use crate::request_loop::{LlmRequestLoop, OutcomeKind, SendRequest, DEFAULT_MAX_TOOL_ROUNDS};
use crate::session::{channel_listener, ChatSession, GenerationGuard, Listener, SessionMap};
use crate::store::{ChatStore, ConversationRecord, StoreError};
use crate::sync::{KeyedLockRegistry, ReentrantMutex, DEFAULT_RECLAIM_INTERVAL};

/// Why a generation could not be started.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("conversation {0} is banned")]
    AlreadyBanned(ConversationId),
    #[error("conversation {id} changed since hash {expected}")]
    HashMismatch { id: ConversationId, expected: String },
    #[error("conversation {0} already has an active generation")]
    AlreadyActive(ConversationId),
    #[error("unknown model `{0}`")]
    UnknownModel(String),
    #[error(transparent)]
    Store(StoreError),
}

struct Inner {
    store: Arc<dyn ChatStore>,
    locks: KeyedLockRegistry<ConversationId>,
    live: SessionMap,
    request_loop: LlmRequestLoop,
    models: Vec<ModelConfig>,
    tools: ToolTable,
    plugins: PluginPipeline,
    moderation: ModerationPipeline,
    retry: ResilienceConfig,
    stream: bool,
}

/// Runs at most one generation per conversation and fans its output out to
/// subscribers.
#[derive(Clone)]
pub struct ChatOrchestrator {
    inner: Arc<Inner>,
}

impl ChatOrchestrator {
    pub fn builder(
        store: Arc<dyn ChatStore>,
        transport: Arc<dyn ChatTransport>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store, transport)
    }

    /// Start generating an answer to `user_text`.
    ///
    /// Succeeds only when no generation is active for the conversation, it is
    /// not banned and `expected_hash` matches the stored history. Returns the
    /// hash of the history with the user message appended.
    pub async fn start_generation(
        &self,
        conversation_id: ConversationId,
        user_text: impl Into<String>,
        model_selector: &str,
        expected_hash: &str,
    ) -> Result<String, StartError> {
        let message = ChatMessage::user().content(user_text).build();
        self.start_generation_with(conversation_id, message, model_selector, expected_hash)
            .await
    }

    /// Like [`start_generation`](Self::start_generation) with a prebuilt user
    /// message, e.g. one carrying images or files.
    pub async fn start_generation_with(
        &self,
        conversation_id: ConversationId,
        message: ChatMessage,
        model_selector: &str,
        expected_hash: &str,
    ) -> Result<String, StartError> {
        let model = self
            .inner
            .models
            .iter()
            .find(|model| model.id == model_selector)
            .cloned()
            .ok_or_else(|| StartError::UnknownModel(model_selector.to_string()))?;

        let lock = self.inner.locks.get_lock(&conversation_id);
        let session_lock = Arc::clone(&lock);
        lock.with_lock(|| {
            self.admit(conversation_id, message, model, expected_hash, session_lock)
        })
        .await
    }

    async fn admit(
        &self,
        id: ConversationId,
        message: ChatMessage,
        model: ModelConfig,
        expected_hash: &str,
        lock: Arc<ReentrantMutex>,
    ) -> Result<String, StartError> {
        let inner = &self.inner;
        if inner.live.contains_key(&id) {
            return Err(StartError::AlreadyActive(id));
        }

        let record = inner.store.load(id).await.map_err(StartError::Store)?;
        if record.banned {
            return Err(StartError::AlreadyBanned(id));
        }
        if record.hash != expected_hash {
            return Err(StartError::HashMismatch {
                id,
                expected: expected_hash.to_string(),
            });
        }

        let mut history = record.history;
        history.push(message);
        let hash = inner
            .store
            .update_history(id, history.clone(), expected_hash, false)
            .await
            .map_err(|err| match err {
                StoreError::HashMismatch { .. } => StartError::HashMismatch {
                    id,
                    expected: expected_hash.to_string(),
                },
                other => StartError::Store(other),
            })?;

        let base = ConversationRecord {
            history,
            hash: hash.clone(),
            banned: false,
        };
        let session = Arc::new(
            ChatSession::new(
                id,
                lock,
                Arc::clone(&inner.store),
                inner.moderation.clone(),
                base,
            )
            .registered_in(Arc::clone(&inner.live)),
        );
        match inner.live.entry(id) {
            Entry::Occupied(_) => {
                log::warn!("conversation {id}: session appeared during admission");
                return Err(StartError::AlreadyActive(id));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&session));
            }
        }

        log::debug!("conversation {id}: starting generation with {}", model.id);
        let running = session.begin_generation();
        tokio::spawn(Arc::clone(inner).run_generation(Arc::clone(&session), model, running));
        Ok(hash)
    }

    /// Attach a listener to the active generation. Returns false when the
    /// conversation has none.
    pub async fn subscribe(&self, conversation_id: ConversationId, listener: Listener) -> bool {
        match self.session(conversation_id) {
            Some(session) => {
                session.subscribe(listener).await;
                true
            }
            None => false,
        }
    }

    /// Subscribe through a channel; `None` when nothing is generating.
    pub async fn subscribe_channel(
        &self,
        conversation_id: ConversationId,
    ) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(conversation_id, channel_listener(tx))
            .await
            .then_some(rx)
    }

    /// Stop the active generation; what was produced so far is kept.
    pub fn cancel_generation(&self, conversation_id: ConversationId) -> bool {
        match self.session(conversation_id) {
            Some(session) => {
                session.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait until the active generation, if any, has terminated.
    pub async fn wait_for(&self, conversation_id: ConversationId) {
        if let Some(session) = self.session(conversation_id) {
            session.join_generation().await;
        }
    }

    pub fn is_active(&self, conversation_id: ConversationId) -> bool {
        self.inner.live.contains_key(&conversation_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.live.len()
    }

    pub fn session(&self, conversation_id: ConversationId) -> Option<Arc<ChatSession>> {
        self.inner
            .live
            .get(&conversation_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Drop lock entries nobody references any more.
    pub fn reclaim_locks(&self) -> usize {
        self.inner.locks.reclaim()
    }

    pub fn has_lock_entry(&self, conversation_id: ConversationId) -> bool {
        self.inner.locks.contains(&conversation_id)
    }
}

impl Inner {
    async fn run_generation(
        self: Arc<Self>,
        session: Arc<ChatSession>,
        model: ModelConfig,
        _running: GenerationGuard,
    ) {
        let id = session.conversation_id();
        let cancel = session.cancel_token();
        let sink = session.sink();

        let outcome = retry::send_with_retry(
            &self.retry,
            &cancel,
            || {
                self.request_loop.send(
                    SendRequest {
                        model: &model,
                        messages: session.history().to_vec(),
                        tools: &self.tools,
                        plugins: &self.plugins,
                        stream: self.stream,
                        cancel: cancel.clone(),
                    },
                    &sink,
                )
            },
            || !session.has_streamed(),
        )
        .await;

        session.record_usage(outcome.usage);
        log::debug!(
            "conversation {id}: generation ended with {:?}, {} messages, {} tokens",
            outcome.kind,
            outcome.messages.len(),
            outcome.usage.total_tokens
        );

        let mut messages = outcome.messages;
        if messages.is_empty() && outcome.kind.is_failure() && !cancel.is_cancelled() {
            messages.push(failure_notice(&outcome.kind));
        }
        session.finish(messages).await;
    }
}

fn failure_notice(kind: &OutcomeKind) -> ChatMessage {
    let text = match kind {
        OutcomeKind::TooManyRequests => {
            "The model is receiving too many requests right now. Please try again later."
        }
        OutcomeKind::ServiceError => {
            "The model service is temporarily unavailable. Please try again later."
        }
        _ => "Something went wrong while generating a response.",
    };
    ChatMessage::assistant()
        .content(text)
        .showing(SHOWING_ERROR)
        .build()
}

/// Builder for [`ChatOrchestrator`].
pub struct OrchestratorBuilder {
    store: Arc<dyn ChatStore>,
    transport: Arc<dyn ChatTransport>,
    models: Vec<ModelConfig>,
    tools: ToolTable,
    plugins: Option<PluginPipeline>,
    moderation: ModerationPipeline,
    retry: ResilienceConfig,
    stream: bool,
    max_tool_rounds: usize,
    reclaim_interval: Duration,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn ChatStore>, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            store,
            transport,
            models: Vec::new(),
            tools: ToolTable::new(),
            plugins: None,
            moderation: ModerationPipeline::disabled(),
            retry: ResilienceConfig::defaults(),
            stream: true,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
        }
    }

    /// Configure everything from an [`EngineConfig`], talking to the
    /// configured provider over HTTP.
    pub fn from_config(config: &EngineConfig, store: Arc<dyn ChatStore>) -> Self {
        let transport: Arc<dyn ChatTransport> = Arc::new(ProviderClient::new(&config.provider));
        let mut builder = Self::new(store, Arc::clone(&transport))
            .retry(config.retry.clone())
            .streaming(config.provider.stream)
            .max_tool_rounds(config.limits.max_tool_rounds);
        for model in &config.models {
            builder = builder.model(model.clone());
        }

        if config.moderation.enabled {
            let moderation_model = config
                .moderation
                .model
                .clone()
                .or_else(|| config.models.first().map(|m| m.backing_model().to_string()));
            match moderation_model {
                Some(model) => {
                    let moderator = LlmModerator::new(transport, model)
                        .context_chars(config.moderation.context_chars);
                    builder = builder.moderation(ModerationPipeline::new(
                        Arc::new(moderator),
                        &config.moderation,
                    ));
                }
                None => log::warn!("moderation enabled but no model configured, disabling"),
            }
        }
        builder
    }

    pub fn model(mut self, model: ModelConfig) -> Self {
        self.models.push(model);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn ChatTool>) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn tools(mut self, tools: ToolTable) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the default plugins (system prompt, image flattening, response log).
    pub fn plugins(mut self, plugins: PluginPipeline) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn moderation(mut self, moderation: ModerationPipeline) -> Self {
        self.moderation = moderation;
        self
    }

    pub fn retry(mut self, retry: ResilienceConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    pub fn reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Build the orchestrator. Inside a tokio runtime this also starts the
    /// background sweep of unused conversation locks.
    pub fn build(self) -> ChatOrchestrator {
        let plugins = self.plugins.unwrap_or_else(|| {
            PluginPipeline::new()
                .with(Arc::new(SystemPromptPlugin::from_model()))
                .with(Arc::new(ImageFlattenPlugin::new()))
                .with(Arc::new(ResponseLogPlugin))
        });
        let request_loop = LlmRequestLoop::new(self.transport, &self.models)
            .max_tool_rounds(self.max_tool_rounds);
        let locks = KeyedLockRegistry::new();
        if tokio::runtime::Handle::try_current().is_ok() {
            locks.spawn_reclaim_task(self.reclaim_interval, "conversation");
        }

        ChatOrchestrator {
            inner: Arc::new(Inner {
                store: self.store,
                locks,
                live: Arc::new(DashMap::new()),
                request_loop,
                models: self.models,
                tools: self.tools,
                plugins,
                moderation: self.moderation,
                retry: self.retry,
                stream: self.stream,
            }),
        }
    }
}
