//! Best-effort delivery of turn progress to the calling client.
//!
//! Nothing here may block or fail the transcript path. Sinks are
//! synchronous and non-blocking; a slow consumer loses events, a gone
//! consumer gets torn down.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::LiveError;

/// A progress notification for UI rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum LiveEvent {
    Token {
        text: String,
    },
    ToolStarted {
        call_id: String,
        name: String,
        input: Value,
    },
    ToolFinished {
        call_id: String,
        name: String,
        output: String,
    },
}

pub trait LiveSink: Send {
    fn send(&mut self, event: LiveEvent) -> Result<(), LiveError>;
}

/// Discards everything. Used for non-streaming turns.
pub struct NoLiveSink;

impl LiveSink for NoLiveSink {
    fn send(&mut self, _: LiveEvent) -> Result<(), LiveError> {
        Ok(())
    }
}

/// Forwards events into a bounded channel without waiting for capacity.
pub struct ChannelLiveSink {
    tx: mpsc::Sender<LiveEvent>,
}

impl ChannelLiveSink {
    pub fn new(tx: mpsc::Sender<LiveEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver the client reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LiveEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl LiveSink for ChannelLiveSink {
    fn send(&mut self, event: LiveEvent) -> Result<(), LiveError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LiveError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => LiveError::Disconnected,
        })
    }
}
