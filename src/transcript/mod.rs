pub mod file;
pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MessageError, SinkError};
use crate::message::{Message, Role};

pub use file::FileTranscript;
pub use http::BackendTranscript;
pub use memory::MemoryTranscript;

/// Durable, append-only message storage. One call per message; the store
/// assigns each message a sequence that increases within a conversation.
///
/// A write may be retried after the store committed it but the caller saw an
/// error. Implementations must treat a repeated [`NewMessage::id`] as the same
/// message and return the record already stored.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError>;

    /// All messages of a conversation in sequence order.
    async fn list_messages(&self, conversation_id: &str)
        -> Result<Vec<PersistedMessage>, SinkError>;
}

#[async_trait]
impl<T: TranscriptSink + ?Sized> TranscriptSink for Arc<T> {
    async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError> {
        (**self).create_message(message).await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, SinkError> {
        (**self).list_messages(conversation_id).await
    }
}

/// The create-message request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Idempotency key, minted once per message and reused across retries.
    /// Stores keep it as the persisted id.
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: Option<String>,
    pub tool_call_id: Option<String>,
    pub raw_message: Value,
}

impl NewMessage {
    pub fn from_message(conversation_id: &str, message: &Message) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: message.role(),
            content: message.content().map(str::to_string),
            tool_call_id: message.tool_call_id().map(str::to_string),
            raw_message: message.to_raw(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: String,
    pub conversation_id: String,
    pub sequence: u64,
    pub role: Role,
    pub content: Option<String>,
    pub tool_call_id: Option<String>,
    pub raw_message: Value,
    pub created_at: DateTime<Utc>,
}

impl PersistedMessage {
    pub(crate) fn assign(message: NewMessage, sequence: u64) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sequence,
            role: message.role,
            content: message.content,
            tool_call_id: message.tool_call_id,
            raw_message: message.raw_message,
            created_at: Utc::now(),
        }
    }

    /// Decode the stored raw form.
    pub fn message(&self) -> Result<Message, MessageError> {
        Message::from_raw(&self.raw_message)
    }
}

/// Rebuild model context from a stored conversation. Messages that do not
/// decode are skipped.
pub fn replay_history(messages: &[PersistedMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|m| match m.message() {
            Ok(msg) => Some(msg.to_raw()),
            Err(e) => {
                tracing::warn!(
                    sequence = m.sequence,
                    error = %e,
                    "skipping undecodable message in history"
                );
                None
            }
        })
        .collect()
}
