//! Live state of one running generation and its subscribers.
//!
//! A session moves from active to finished, or from active to banned. Every
//! transition and every mutation of the accumulated content, the listener
//! set and the moderation offset happens under the conversation's reentrant
//! lock, which is shared with the orchestrator's admission path.

mod listener;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::{ChatMessage, ChatRole, ConversationId, StreamEvent, Usage};
use crate::moderation::ModerationPipeline;
use crate::request_loop::EventSink;
use crate::store::{ChatStore, ConversationRecord};
use crate::sync::ReentrantMutex;

pub use listener::{channel_listener, Listener, ListenerGone};
use listener::ListenerSet;

/// Sessions currently generating, by conversation.
pub type SessionMap = Arc<DashMap<ConversationId, Arc<ChatSession>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Finished,
    Banned,
}

#[derive(Default)]
struct SessionState {
    content: String,
    reasoning: String,
    /// Reasoning and content in arrival order; the text moderation sees
    moderated: String,
    /// Bytes of `moderated` already handed to moderation
    checked_offset: usize,
    listeners: ListenerSet,
    banned: bool,
    finished: bool,
    usage: Usage,
    persisted_hash: Option<String>,
}

pub struct ChatSession {
    conversation_id: ConversationId,
    seed_user_content: String,
    lock: Arc<ReentrantMutex>,
    state: Mutex<SessionState>,
    moderation_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// True while a generation task is running for this session
    generation: watch::Sender<bool>,
    cancel: CancellationToken,
    store: Arc<dyn ChatStore>,
    moderation: ModerationPipeline,
    /// Persisted history the generation continues from
    base: ConversationRecord,
    live: Option<SessionMap>,
}

impl ChatSession {
    /// `base` is the stored conversation including the new user message.
    pub fn new(
        conversation_id: ConversationId,
        lock: Arc<ReentrantMutex>,
        store: Arc<dyn ChatStore>,
        moderation: ModerationPipeline,
        base: ConversationRecord,
    ) -> Self {
        let seed_user_content = base
            .history
            .iter()
            .rev()
            .find(|msg| msg.role == ChatRole::User)
            .map(ChatMessage::text)
            .unwrap_or_default();
        Self {
            conversation_id,
            seed_user_content,
            lock,
            state: Mutex::new(SessionState::default()),
            moderation_tasks: Mutex::new(Vec::new()),
            generation: watch::channel(false).0,
            cancel: CancellationToken::new(),
            store,
            moderation,
            base,
            live: None,
        }
    }

    /// Remove the session from `live` once it terminates.
    pub fn registered_in(mut self, live: SessionMap) -> Self {
        self.live = Some(live);
        self
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn seed_user_content(&self) -> &str {
        &self.seed_user_content
    }

    /// History sent to the model for this generation.
    pub fn history(&self) -> &[ChatMessage] {
        &self.base.history
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the running generation to stop; it finishes with what it has.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Mark a generation as running until the returned guard is dropped.
    pub fn begin_generation(self: &Arc<Self>) -> GenerationGuard {
        self.generation.send_replace(true);
        GenerationGuard {
            session: Arc::clone(self),
        }
    }

    /// Wait until no generation is running. Any number of callers may wait.
    pub async fn join_generation(&self) {
        let mut running = self.generation.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    pub fn phase(&self) -> SessionPhase {
        let state = self.state.lock();
        if state.banned {
            SessionPhase::Banned
        } else if state.finished {
            SessionPhase::Finished
        } else {
            SessionPhase::Active
        }
    }

    pub fn content(&self) -> String {
        self.state.lock().content.clone()
    }

    /// Whether any content or reasoning reached the listeners.
    pub fn has_streamed(&self) -> bool {
        let state = self.state.lock();
        !state.content.is_empty() || !state.reasoning.is_empty()
    }

    pub fn checked_offset(&self) -> usize {
        self.state.lock().checked_offset
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    pub fn usage(&self) -> Usage {
        self.state.lock().usage
    }

    pub fn record_usage(&self, usage: Usage) {
        self.state.lock().usage += usage;
    }

    /// Hash written by the terminal transition, once persisted.
    pub fn persisted_hash(&self) -> Option<String> {
        self.state.lock().persisted_hash.clone()
    }

    pub fn sink(self: &Arc<Self>) -> SessionSink {
        SessionSink {
            session: Arc::clone(self),
        }
    }

    /// Append streamed output and fan it out. Once enough unchecked content
    /// has accumulated, the offset moves to the end before the check is
    /// spawned, so no two checks cover the same bytes.
    pub async fn on_delta(self: &Arc<Self>, content: String, reasoning: String) {
        self.lock
            .with_lock(|| async move { self.apply_delta(content, reasoning) })
            .await
    }

    fn apply_delta(self: &Arc<Self>, content: String, reasoning: String) {
        let pending_check = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.content.push_str(&content);
            state.reasoning.push_str(&reasoning);
            state.moderated.push_str(&reasoning);
            state.moderated.push_str(&content);
            state
                .listeners
                .broadcast(&StreamEvent::MessageDelta { content, reasoning });

            let len = state.moderated.len();
            if !self.moderation.is_enabled() {
                state.checked_offset = len;
                None
            } else if len - state.checked_offset >= self.moderation.threshold() {
                let offset = state.checked_offset;
                let prior = state.moderated[..offset].to_string();
                let suffix = state.moderated[offset..].to_string();
                state.checked_offset = len;
                Some((prior, suffix))
            } else {
                None
            }
        };

        if let Some((prior, suffix)) = pending_check {
            self.spawn_check(prior, suffix);
        }
    }

    fn spawn_check(self: &Arc<Self>, prior: String, suffix: String) {
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if session
                .moderation
                .check(session.conversation_id, &prior, &suffix)
                .await
            {
                session.ban().await;
            }
        });
        self.moderation_tasks.lock().push(handle);
    }

    /// Add a subscriber. It first receives everything streamed so far as a
    /// single delta, then live events.
    pub async fn subscribe(&self, mut listener: Listener) {
        self.lock
            .with_lock(|| async move {
                let mut state = self.state.lock();
                if state.banned {
                    let _ = listener(&StreamEvent::Banned);
                    return;
                }
                let catch_up = StreamEvent::MessageDelta {
                    content: state.content.clone(),
                    reasoning: state.reasoning.clone(),
                };
                if listener(&catch_up).is_err() {
                    return;
                }
                if state.finished {
                    let _ = listener(&StreamEvent::Finished);
                    return;
                }
                state.listeners.push(listener);
            })
            .await
    }

    /// Fan out a non-delta event from the request loop.
    pub async fn broadcast(&self, event: StreamEvent) {
        self.lock
            .with_lock(|| async move {
                let mut state = self.state.lock();
                if !state.finished {
                    state.listeners.broadcast(&event);
                }
            })
            .await
    }

    /// Terminate the session because moderation flagged its content.
    ///
    /// Only the first call notifies listeners and persists the replacement
    /// message; a session that already finished normally is left alone.
    pub async fn ban(&self) {
        self.lock
            .with_lock(|| async {
                {
                    let mut state = self.state.lock();
                    if state.banned {
                        return;
                    }
                    if state.finished {
                        log::warn!(
                            "conversation {}: ban after finish ignored",
                            self.conversation_id
                        );
                        return;
                    }
                    state.banned = true;
                    state.finished = true;
                    state.listeners.broadcast(&StreamEvent::Banned);
                    state.listeners.clear();
                }
                self.cancel.cancel();

                let replacement = ChatMessage::assistant()
                    .content(self.moderation.replacement())
                    .build();
                self.persist(vec![replacement], true).await;
                self.detach();
            })
            .await
    }

    /// Terminate the session normally and persist `messages`.
    ///
    /// Outstanding moderation checks are joined first, outside the lock, and
    /// the remaining unchecked content is checked before the session may
    /// finish. No-op once the session is finished or banned.
    pub async fn finish(&self, messages: Vec<ChatMessage>) {
        self.join_moderation().await;

        self.lock
            .with_lock(|| async {
                let pending_check = {
                    let mut state = self.state.lock();
                    if state.finished {
                        return;
                    }
                    let len = state.moderated.len();
                    let offset = state.checked_offset;
                    state.checked_offset = len;
                    (self.moderation.is_enabled() && offset < len).then(|| {
                        (
                            state.moderated[..offset].to_string(),
                            state.moderated[offset..].to_string(),
                        )
                    })
                };

                if let Some((prior, suffix)) = pending_check {
                    if self
                        .moderation
                        .check(self.conversation_id, &prior, &suffix)
                        .await
                    {
                        self.ban().await;
                        return;
                    }
                }

                {
                    let mut state = self.state.lock();
                    if state.finished {
                        return;
                    }
                    state.finished = true;
                    state.listeners.broadcast(&StreamEvent::Finished);
                    state.listeners.clear();
                }
                self.persist(messages, false).await;
                self.detach();
            })
            .await
    }

    async fn join_moderation(&self) {
        if self.lock.is_held_by_current() {
            log::warn!(
                "conversation {}: finish called under the session lock, not joining moderation",
                self.conversation_id
            );
            return;
        }
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.moderation_tasks.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    log::warn!(
                        "conversation {}: moderation task failed: {err}",
                        self.conversation_id
                    );
                }
            }
        }
    }

    /// Write the terminal history. Runs in its own task so it completes even
    /// if the caller is dropped.
    async fn persist(&self, messages: Vec<ChatMessage>, banned: bool) {
        let store = Arc::clone(&self.store);
        let id = self.conversation_id;
        let expected_hash = self.base.hash.clone();
        let mut history = self.base.history.clone();
        history.extend(messages);

        let write = tokio::spawn(async move {
            store
                .update_history(id, history, &expected_hash, banned)
                .await
        });
        match write.await {
            Ok(Ok(hash)) => {
                log::debug!("conversation {id}: persisted terminal history (banned: {banned})");
                self.state.lock().persisted_hash = Some(hash);
            }
            Ok(Err(err)) => log::warn!("conversation {id}: persisting history failed: {err}"),
            Err(err) => log::warn!("conversation {id}: persist task failed: {err}"),
        }
    }

    fn detach(&self) {
        if let Some(live) = &self.live {
            live.remove_if(&self.conversation_id, |_, session| {
                std::ptr::eq(Arc::as_ptr(session), self)
            });
        }
    }
}

/// Held by the generation task; dropping it, even on panic, releases
/// [`ChatSession::join_generation`] waiters.
pub struct GenerationGuard {
    session: Arc<ChatSession>,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.session.generation.send_replace(false);
    }
}

/// [`EventSink`] feeding request loop events into a session.
pub struct SessionSink {
    session: Arc<ChatSession>,
}

#[async_trait]
impl EventSink for SessionSink {
    async fn emit(&self, event: StreamEvent) {
        match event {
            StreamEvent::MessageDelta { content, reasoning } => {
                self.session.on_delta(content, reasoning).await
            }
            other => self.session.broadcast(other).await,
        }
    }
}
