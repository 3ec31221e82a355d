use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::{NewMessage, PersistedMessage, TranscriptSink};
use crate::error::SinkError;

/// Appends each conversation to `<dir>/<conversation_id>.jsonl`, one
/// persisted message per line.
pub struct FileTranscript {
    dir: PathBuf,
    // Last record written per conversation. Also serializes appends.
    last_written: Mutex<HashMap<String, PersistedMessage>>,
}

impl FileTranscript {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_written: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, conversation_id: &str) -> Result<PathBuf, SinkError> {
        let valid = !conversation_id.is_empty()
            && conversation_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SinkError::InvalidConversation(conversation_id.to_string()));
        }
        Ok(self.dir.join(format!("{conversation_id}.jsonl")))
    }

    async fn read_log(&self, conversation_id: &str) -> Result<Vec<PersistedMessage>, SinkError> {
        let path = self.path(conversation_id)?;
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SinkError::Io(e.to_string())),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| SinkError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn open_append(&self, path: &Path) -> Result<tokio::fs::File, SinkError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| SinkError::Io(e.to_string()))
    }
}

#[async_trait]
impl TranscriptSink for FileTranscript {
    async fn create_message(&self, message: NewMessage) -> Result<PersistedMessage, SinkError> {
        let path = self.path(&message.conversation_id)?;
        let mut last_written = self.last_written.lock().await;

        let last = match last_written.get(&message.conversation_id) {
            Some(last) => Some(last.clone()),
            None => {
                let log = self.read_log(&message.conversation_id).await?;
                if let Some(stored) = log.iter().find(|m| m.id == message.id) {
                    return Ok(stored.clone());
                }
                log.last().cloned()
            }
        };

        // Retry of a line that reached the file but was not confirmed.
        if let Some(last) = last.as_ref().filter(|m| m.id == message.id) {
            debug!(sequence = last.sequence, "write already on disk, syncing");
            self.open_append(&path)
                .await?
                .sync_data()
                .await
                .map_err(|e| SinkError::Io(e.to_string()))?;
            return Ok(last.clone());
        }

        let sequence = last.map_or(1, |m| m.sequence + 1);
        let persisted = PersistedMessage::assign(message, sequence);
        let mut line = serde_json::to_string(&persisted)
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = self.open_append(&path).await?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;
        last_written.insert(persisted.conversation_id.clone(), persisted.clone());

        file.sync_data()
            .await
            .map_err(|e| SinkError::Io(e.to_string()))?;
        Ok(persisted)
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<PersistedMessage>, SinkError> {
        self.read_log(conversation_id).await
    }
}
