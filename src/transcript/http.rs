use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use super::{NewMessage, PersistedMessage, TranscriptSink};
use crate::error::SinkError;
use crate::message::Role;

const PAGE_LIMIT: usize = 100;

/// Conversation backend reached over HTTP.
///
/// Writes go to `POST /tools/save-message`; history is read from
/// `GET /api/conversations/{id}/messages`, following `next_cursor` until
/// `has_next` is false. The backend does not expose a sequence column, so
/// sequences are the position in the listed history, tracked locally after
/// the first read.
///
/// Each write carries the message's idempotency key, both in the body and as
/// an `Idempotency-Key` header. A server that answers a repeated key with the
/// record it already stored does not advance the local sequence.
pub struct BackendTranscript {
    client: reqwest::Client,
    base_url: String,
    // Last (sequence, stored id) per conversation.
    sequences: Mutex<HashMap<String, (u64, String)>>,
}

impl BackendTranscript {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_page(
        &self,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage, SinkError> {
        let mut query = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("direction", "next".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let resp = self
            .client
            .get(format!(
                "{}/api/conversations/{conversation_id}/messages",
                self.base_url
            ))
            .query(&query)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let text = read_body(resp).await?;
        serde_json::from_str(&text).map_err(|e| SinkError::Serialization(e.to_string()))
    }
}

pub(crate) async fn read_body(resp: reqwest::Response) -> Result<String, SinkError> {
    let status = resp.status().as_u16();
    let text = resp
        .text()
        .await
        .map_err(|e| SinkError::Unavailable(e.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(SinkError::Rejected { status, body: text });
    }
    Ok(text)
}

#[async_trait]
impl TranscriptSink for BackendTranscript {
    async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError> {
        let mut sequences = self.sequences.lock().await;
        let last = match sequences.get(&message.conversation_id) {
            Some(last) => last.clone(),
            None => {
                let history = self.list_messages(&message.conversation_id).await?;
                let last_id = history.last().map(|m| m.id.clone()).unwrap_or_default();
                (history.len() as u64, last_id)
            }
        };

        let payload = json!({
            "id": message.id,
            "conversation_id": message.conversation_id,
            "role": message.role,
            "content": message.content,
            "tool_call_id": message.tool_call_id,
            "raw_message": message.raw_message,
        });

        let resp = self
            .client
            .post(format!("{}/tools/save-message", self.base_url))
            .header("idempotency-key", &message.id)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let text = read_body(resp).await?;
        let saved: SavedMessage =
            serde_json::from_str(&text).map_err(|e| SinkError::Serialization(e.to_string()))?;

        let (last_sequence, last_id) = last;
        let sequence = if saved.message.id == last_id {
            last_sequence
        } else {
            last_sequence + 1
        };
        let persisted = saved.message.into_persisted(sequence);
        debug!(
            conversation_id = %persisted.conversation_id,
            sequence = persisted.sequence,
            role = %persisted.role,
            "message saved"
        );
        sequences.insert(
            persisted.conversation_id.clone(),
            (persisted.sequence, persisted.id.clone()),
        );
        Ok(persisted)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, SinkError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.fetch_page(conversation_id, cursor.as_deref()).await?;
            for msg in page.data {
                let sequence = out.len() as u64 + 1;
                out.push(msg.into_persisted(sequence));
            }
            match page.pagination {
                Some(p) if p.has_next && !p.next_cursor.is_empty() => {
                    cursor = Some(p.next_cursor)
                }
                _ => break,
            }
        }

        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct BackendMessage {
    id: String,
    conversation_id: String,
    role: Role,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    raw_message: Value,
    created_at: DateTime<Utc>,
}

impl BackendMessage {
    fn into_persisted(self, sequence: u64) -> PersistedMessage {
        PersistedMessage {
            id: self.id,
            conversation_id: self.conversation_id,
            sequence,
            role: self.role,
            content: self.content,
            tool_call_id: self.tool_call_id,
            raw_message: self.raw_message,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SavedMessage {
    message: BackendMessage,
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    #[serde(default)]
    data: Vec<BackendMessage>,
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_cursor: String,
    #[serde(default)]
    has_next: bool,
}
