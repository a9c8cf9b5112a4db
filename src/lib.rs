//! Conversation orchestration on top of an OpenAI-compatible chat completion API.
//!
//! The crate keeps at most one generation alive per conversation, streams partial
//! output to any number of listeners, runs the tool-call loop against the provider
//! and moderates generated text incrementally while it is being produced.
//!
//! The entry point is [`orchestrator::ChatOrchestrator`]; the building blocks it
//! wires together are public so they can be used on their own:
//!
//! - [`sync`]: keyed, reclaimable, reentrant async locks
//! - [`request_loop`]: one logical "ask" as a bounded loop of provider round-trips
//! - [`plugin`]: hooks around each round-trip
//! - [`session`]: the per-conversation state machine and listener fan-out
//! - [`moderation`]: incremental content checks

pub mod chat;
pub mod config;
pub mod error;
pub mod moderation;
pub mod orchestrator;
pub mod plugin;
pub mod provider;
pub mod request_loop;
pub mod session;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use chat::{ChatMessage, ChatRole, ConversationId, StreamEvent, ToolCall, Usage};
pub use config::EngineConfig;
pub use error::ProviderError;
pub use orchestrator::{ChatOrchestrator, OrchestratorBuilder, StartError};
pub use request_loop::{LlmRequestLoop, OutcomeKind, RequestOutcome};
pub use session::ChatSession;
pub use store::{ChatStore, ConversationRecord, InMemoryChatStore, StoreError};
