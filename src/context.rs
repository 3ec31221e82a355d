//! Per-turn mutable state.
//!
//! A `TurnContext` belongs to exactly one in-flight turn and is dropped with
//! it. Every phase change happens inside one of the operations below, so the
//! "is a batch open" question has a single answer: `phase == ToolBatchOpen`.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::message::ToolCall;

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Generating,
    /// Tool calls are being collected and nothing has been persisted yet.
    ToolBatchOpen,
    /// The batch is persisted; results are being recorded as they arrive.
    ToolExecuting,
    Finalizing,
    Complete,
    Truncated,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Truncated)
    }
}

#[derive(Debug)]
pub struct TurnContext {
    accumulated_text: String,
    pending_tool_calls: Vec<ToolCall>,
    pending_batch_flushed: bool,
    sequence_counter: u64,
    phase: TurnPhase,
    // source run id -> transcript call id, for every call started this turn
    correlation: HashMap<String, String>,
    // persisted calls still waiting for their result, in call order
    awaiting: Vec<ToolCall>,
}

impl Default for TurnContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnContext {
    pub fn new() -> Self {
        Self {
            accumulated_text: String::new(),
            pending_tool_calls: Vec::new(),
            pending_batch_flushed: false,
            sequence_counter: 0,
            phase: TurnPhase::Idle,
            correlation: HashMap::new(),
            awaiting: Vec::new(),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn pending_tool_calls(&self) -> &[ToolCall] {
        &self.pending_tool_calls
    }

    pub fn pending_batch_flushed(&self) -> bool {
        self.pending_batch_flushed
    }

    pub fn batch_open(&self) -> bool {
        self.phase == TurnPhase::ToolBatchOpen
    }

    /// Persisted calls that have not received a result.
    pub fn awaiting_results(&self) -> &[ToolCall] {
        &self.awaiting
    }

    /// Messages persisted so far in this turn.
    pub fn sequence_counter(&self) -> u64 {
        self.sequence_counter
    }

    pub fn append_token(&mut self, text: &str) {
        self.accumulated_text.push_str(text);
        match self.phase {
            TurnPhase::Idle => self.phase = TurnPhase::Generating,
            TurnPhase::ToolExecuting if self.awaiting.is_empty() => {
                self.phase = TurnPhase::Generating
            }
            _ => {}
        }
    }

    pub fn knows_run(&self, run_id: &str) -> bool {
        self.correlation.contains_key(run_id)
    }

    /// Register a tool call and return its transcript id. Opens a new batch
    /// unless one is already collecting.
    pub fn begin_tool_call(&mut self, run_id: &str, name: &str, input: &Value) -> String {
        if !self.batch_open() {
            self.reset_batch();
        }

        let id = format!("call_{}", uuid::Uuid::new_v4().simple());
        self.pending_tool_calls.push(ToolCall {
            id: id.clone(),
            name: name.to_string(),
            arguments: arguments_json(input),
        });
        self.correlation.insert(run_id.to_string(), id.clone());
        self.phase = TurnPhase::ToolBatchOpen;
        id
    }

    /// Start a fresh batch. Text accumulated so far belongs to a cycle that
    /// chose to call tools and is not part of the answer.
    pub fn reset_batch(&mut self) {
        if !self.accumulated_text.is_empty() {
            debug!(
                chars = self.accumulated_text.chars().count(),
                "discarding deliberation text"
            );
        }
        self.accumulated_text.clear();
        self.pending_tool_calls.clear();
        self.pending_batch_flushed = false;
    }

    /// The open batch has been durably persisted.
    pub fn mark_batch_flushed(&mut self) {
        self.pending_batch_flushed = true;
        self.awaiting.extend(self.pending_tool_calls.iter().cloned());
        self.phase = TurnPhase::ToolExecuting;
    }

    /// Match a finished tool to its awaiting call. `None` means the run id
    /// was never started or its result was already recorded.
    pub fn resolve_result(&mut self, run_id: &str) -> Option<ToolCall> {
        let call_id = self.correlation.get(run_id)?;
        let index = self.awaiting.iter().position(|c| &c.id == call_id)?;
        let call = self.awaiting.remove(index);
        if self.awaiting.is_empty() && self.phase == TurnPhase::ToolExecuting {
            self.phase = TurnPhase::Generating;
        }
        Some(call)
    }

    /// Take the answer text. An explicit, non-empty cycle output wins over
    /// the accumulated tokens.
    pub fn take_final_text(&mut self, output: Option<String>) -> String {
        self.phase = TurnPhase::Finalizing;
        let accumulated = std::mem::take(&mut self.accumulated_text);
        match output {
            Some(text) if !text.is_empty() => text,
            _ => accumulated,
        }
    }

    pub fn record_persisted(&mut self) -> u64 {
        self.sequence_counter += 1;
        self.sequence_counter
    }

    pub fn complete(&mut self) {
        self.phase = TurnPhase::Complete;
    }

    pub fn truncate(&mut self) {
        self.phase = TurnPhase::Truncated;
    }
}

/// Chat-completion arguments must be a JSON object encoded as a string.
/// Runtimes that hand over a bare string get it parsed if it is JSON, and
/// wrapped as `{"input": ...}` otherwise.
fn arguments_json(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ Value::Object(_)) => parsed.to_string(),
            _ => serde_json::json!({ "input": s }).to_string(),
        },
        Value::Object(_) => input.to_string(),
        other => serde_json::json!({ "input": other }).to_string(),
    }
}
