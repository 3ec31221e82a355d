use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{NewMessage, PersistedMessage, TranscriptSink};
use crate::error::SinkError;

/// In-process transcript. Fire-and-forget embedding and tests.
#[derive(Default)]
pub struct MemoryTranscript {
    conversations: Mutex<HashMap<String, Vec<PersistedMessage>>>,
}

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for a conversation.
    pub fn len(&self, conversation_id: &str) -> usize {
        self.conversations
            .lock()
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, conversation_id: &str) -> bool {
        self.len(conversation_id) == 0
    }
}

#[async_trait]
impl TranscriptSink for MemoryTranscript {
    async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError> {
        let mut conversations = self.conversations.lock();
        let log = conversations
            .entry(message.conversation_id.clone())
            .or_default();
        if let Some(stored) = log.iter().rev().find(|m| m.id == message.id) {
            return Ok(stored.clone());
        }
        let sequence = log.last().map_or(1, |m| m.sequence + 1);
        let persisted = PersistedMessage::assign(message, sequence);
        log.push(persisted.clone());
        Ok(persisted)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, SinkError> {
        Ok(self
            .conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
