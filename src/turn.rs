use std::collections::HashMap;

use crate::error::TranscriptViolation;
use crate::message::{Message, Role};
use crate::transcript::PersistedMessage;

/// Why a turn ended without a final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationReason {
    /// The event stream ended before a final answer.
    SourceEnded,
    SourceFailed(String),
    /// The client went away and draining was not allowed.
    ClientDisconnected,
    /// The client went away and the stream did not finish within the drain timeout.
    DrainTimeout,
    PersistenceFailed(String),
}

impl std::fmt::Display for TruncationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceEnded => write!(f, "event stream ended"),
            Self::SourceFailed(e) => write!(f, "event source failed: {e}"),
            Self::ClientDisconnected => write!(f, "client disconnected"),
            Self::DrainTimeout => write!(f, "client disconnected, drain timed out"),
            Self::PersistenceFailed(e) => write!(f, "persistence failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    Complete,
    Truncated(TruncationReason),
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Truncated(reason) => write!(f, "incomplete ({reason})"),
        }
    }
}

/// The messages persisted while answering one user input.
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn_id: String,
    pub conversation_id: String,
    pub status: TurnStatus,
    pub messages: Vec<PersistedMessage>,
}

impl Turn {
    pub fn is_complete(&self) -> bool {
        self.status == TurnStatus::Complete
    }

    /// The answer text, only for complete turns.
    pub fn final_answer(&self) -> Option<&str> {
        if !self.is_complete() {
            return None;
        }
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant && m.raw_message.get("tool_calls").is_none())
            .and_then(|m| m.content.as_deref())
    }

    /// Decoded messages in sequence order.
    pub fn decoded(&self) -> Result<Vec<Message>, TranscriptViolation> {
        self.messages
            .iter()
            .map(|m| {
                m.message().map_err(|source| TranscriptViolation::Undecodable {
                    sequence: m.sequence,
                    source,
                })
            })
            .collect()
    }

    /// Check the ordering rules every persisted turn must satisfy.
    ///
    /// Results must follow their call, each call resolves at most once, a
    /// final answer can only be last, and a complete turn has every call
    /// resolved and ends with its answer.
    pub fn validate(&self) -> Result<(), TranscriptViolation> {
        let decoded = self.decoded()?;
        // call id -> whether a result has been seen
        let mut calls: HashMap<&str, bool> = HashMap::new();
        let mut previous: Option<u64> = None;

        for (persisted, message) in self.messages.iter().zip(&decoded) {
            if let Some(previous) = previous {
                if persisted.sequence <= previous {
                    return Err(TranscriptViolation::NonMonotonicSequence {
                        previous,
                        sequence: persisted.sequence,
                    });
                }
            }
            previous = Some(persisted.sequence);

            match message {
                Message::AssistantToolCalls { tool_calls } => {
                    for call in tool_calls {
                        if calls.insert(call.id.as_str(), false).is_some() {
                            return Err(TranscriptViolation::DuplicateCall(call.id.clone()));
                        }
                    }
                }
                Message::ToolResult { tool_call_id, .. } => {
                    match calls.get_mut(tool_call_id.as_str()) {
                        None => {
                            return Err(TranscriptViolation::OrphanResult(tool_call_id.clone()))
                        }
                        Some(true) => {
                            return Err(TranscriptViolation::DuplicateResult(
                                tool_call_id.clone(),
                            ))
                        }
                        Some(seen) => *seen = true,
                    }
                }
                Message::AssistantFinal { .. } => {
                    if persisted.sequence != self.messages[self.messages.len() - 1].sequence {
                        return Err(TranscriptViolation::FinalNotLast(persisted.sequence));
                    }
                }
                Message::User { .. } => {}
            }
        }

        if self.is_complete() {
            if !decoded.last().is_some_and(Message::is_final) {
                return Err(TranscriptViolation::MissingFinal);
            }
            let mut unresolved: Vec<&str> = calls
                .iter()
                .filter(|(_, seen)| !**seen)
                .map(|(id, _)| *id)
                .collect();
            unresolved.sort_unstable();
            if let Some(id) = unresolved.first() {
                return Err(TranscriptViolation::MissingResult(id.to_string()));
            }
        }

        Ok(())
    }
}
