//! Persistence seam for conversation histories.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::chat::{ChatMessage, ConversationId};

/// Stored state of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub history: Vec<ChatMessage>,
    /// Version tag; every write produces a new one
    pub hash: String,
    pub banned: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    #[error("history hash mismatch: expected {expected}, found {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("chat store error: {0}")]
    Backend(String),
}

/// External chat store. Writes are guarded by optimistic hashes.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn load(&self, id: ConversationId) -> Result<ConversationRecord, StoreError>;

    /// Replace the history if the stored hash still equals `expected_hash`;
    /// returns the new hash.
    async fn update_history(
        &self,
        id: ConversationId,
        history: Vec<ChatMessage>,
        expected_hash: &str,
        banned: bool,
    ) -> Result<String, StoreError>;
}

/// [`ChatStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    conversations: Mutex<HashMap<ConversationId, StoredConversation>>,
}

#[derive(Debug, Clone)]
struct StoredConversation {
    record: ConversationRecord,
    writes: usize,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty conversation and return its id and initial hash.
    pub fn create_conversation(&self) -> (ConversationId, String) {
        self.insert(ConversationId::new(), Vec::new(), false)
    }

    /// Seed a conversation with an existing history.
    pub fn insert(
        &self,
        id: ConversationId,
        history: Vec<ChatMessage>,
        banned: bool,
    ) -> (ConversationId, String) {
        let hash = new_hash();
        self.conversations.lock().insert(
            id,
            StoredConversation {
                record: ConversationRecord {
                    history,
                    hash: hash.clone(),
                    banned,
                },
                writes: 0,
            },
        );
        (id, hash)
    }

    pub fn snapshot(&self, id: ConversationId) -> Option<ConversationRecord> {
        self.conversations
            .lock()
            .get(&id)
            .map(|stored| stored.record.clone())
    }

    /// Number of successful `update_history` calls for `id`.
    pub fn writes(&self, id: ConversationId) -> usize {
        self.conversations
            .lock()
            .get(&id)
            .map_or(0, |stored| stored.writes)
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn load(&self, id: ConversationId) -> Result<ConversationRecord, StoreError> {
        self.snapshot(id).ok_or(StoreError::NotFound(id))
    }

    async fn update_history(
        &self,
        id: ConversationId,
        history: Vec<ChatMessage>,
        expected_hash: &str,
        banned: bool,
    ) -> Result<String, StoreError> {
        let mut conversations = self.conversations.lock();
        let stored = conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        if stored.record.hash != expected_hash {
            return Err(StoreError::HashMismatch {
                expected: expected_hash.to_string(),
                actual: stored.record.hash.clone(),
            });
        }
        let hash = new_hash();
        stored.record = ConversationRecord {
            history,
            hash: hash.clone(),
            banned,
        };
        stored.writes += 1;
        Ok(hash)
    }
}

fn new_hash() -> String {
    Uuid::new_v4().simple().to_string()
}
