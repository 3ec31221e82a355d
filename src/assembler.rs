use tracing::{debug, info, warn};

use crate::context::{TurnContext, TurnPhase};
use crate::error::{LiveError, SinkError};
use crate::events::TurnEvent;
use crate::ledger::AppendGuard;
use crate::live::{LiveEvent, LiveSink};
use crate::message::Message;
use crate::retry::RetryPolicy;
use crate::transcript::{NewMessage, PersistedMessage, TranscriptSink};

/// What the run loop should do after an event.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Complete,
}

/// A transcript write that could not be completed.
#[derive(Debug)]
pub(crate) struct PersistFailure {
    pub attempts: u32,
    pub error: SinkError,
}

/// Applies events to one turn's context and writes the resulting messages.
pub(crate) struct TurnAssembler<'a> {
    conversation_id: &'a str,
    transcript: &'a dyn TranscriptSink,
    retry: &'a RetryPolicy,
    guard: &'a AppendGuard,
    max_tool_output_chars: usize,
    ctx: TurnContext,
    live: Option<Box<dyn LiveSink>>,
    messages: Vec<PersistedMessage>,
}

impl<'a> TurnAssembler<'a> {
    pub fn new(
        conversation_id: &'a str,
        transcript: &'a dyn TranscriptSink,
        retry: &'a RetryPolicy,
        guard: &'a AppendGuard,
        max_tool_output_chars: usize,
        live: Box<dyn LiveSink>,
    ) -> Self {
        Self {
            conversation_id,
            transcript,
            retry,
            guard,
            max_tool_output_chars,
            ctx: TurnContext::new(),
            live: Some(live),
            messages: Vec::new(),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.ctx.phase()
    }

    pub fn into_messages(self) -> Vec<PersistedMessage> {
        self.messages
    }

    /// Drop the live sink. The transcript path is unaffected.
    pub fn disconnect_live(&mut self) {
        if self.live.take().is_some() {
            info!("live stream torn down");
        }
    }

    pub async fn record_user(&mut self, content: &str) -> Result<(), PersistFailure> {
        self.persist(Message::User {
            content: content.to_string(),
        })
        .await
    }

    pub async fn apply(&mut self, event: TurnEvent) -> Result<Step, PersistFailure> {
        debug!(event = event.kind(), phase = ?self.ctx.phase(), "turn event");

        // Anything but another ToolStart closes the batch being collected.
        if self.ctx.batch_open() && !matches!(event, TurnEvent::ToolStart { .. }) {
            self.flush_batch().await?;
        }

        match event {
            TurnEvent::ModelToken { text } => {
                self.notify(LiveEvent::Token { text: text.clone() });
                self.ctx.append_token(&text);
            }
            TurnEvent::ToolStart {
                run_id,
                name,
                input,
            } => {
                if self.ctx.knows_run(&run_id) {
                    warn!(%run_id, tool = %name, "duplicate tool start, dropping");
                    return Ok(Step::Continue);
                }
                let call_id = self.ctx.begin_tool_call(&run_id, &name, &input);
                debug!(%run_id, %call_id, tool = %name, "tool call queued");
                self.notify(LiveEvent::ToolStarted {
                    call_id,
                    name,
                    input,
                });
            }
            TurnEvent::ToolBatchEnd => {
                // Already flushed above when a batch was open.
            }
            TurnEvent::ToolEnd { run_id, output } => {
                let Some(call) = self.ctx.resolve_result(&run_id) else {
                    warn!(%run_id, "tool result matches no awaiting call, dropping");
                    return Ok(Step::Continue);
                };
                let content = truncate_output(output, self.max_tool_output_chars);
                self.persist(Message::ToolResult {
                    tool_call_id: call.id.clone(),
                    content: content.clone(),
                })
                .await?;
                self.notify(LiveEvent::ToolFinished {
                    call_id: call.id,
                    name: call.name,
                    output: content,
                });
            }
            TurnEvent::ModelEnd { output } => {
                let awaiting = self.ctx.awaiting_results().len();
                if awaiting > 0 {
                    debug!(awaiting, "cycle ended with tool calls in flight");
                    return Ok(Step::Continue);
                }
                let content = self.ctx.take_final_text(output);
                self.persist(Message::AssistantFinal { content }).await?;
                self.ctx.complete();
                return Ok(Step::Complete);
            }
        }

        Ok(Step::Continue)
    }

    /// End the turn without a final answer. The open batch, if any, is
    /// still persisted so the decision to call is on record.
    pub async fn truncate(&mut self) -> Result<(), PersistFailure> {
        let flushed = if self.ctx.batch_open() {
            self.flush_batch().await
        } else {
            Ok(())
        };
        self.ctx.truncate();
        flushed
    }

    async fn flush_batch(&mut self) -> Result<(), PersistFailure> {
        let tool_calls = self.ctx.pending_tool_calls().to_vec();
        debug!(calls = tool_calls.len(), "flushing tool call batch");
        self.persist(Message::AssistantToolCalls { tool_calls })
            .await?;
        self.ctx.mark_batch_flushed();
        Ok(())
    }

    async fn persist(&mut self, message: Message) -> Result<(), PersistFailure> {
        let new = NewMessage::from_message(self.conversation_id, &message);
        let transcript = self.transcript;
        let persisted = self
            .retry
            .run("create_message", || transcript.create_message(new.clone()))
            .await
            .map_err(|e| PersistFailure {
                attempts: e.attempts,
                error: e.error,
            })?;

        if !self.guard.observe(persisted.sequence) {
            warn!(
                sequence = persisted.sequence,
                high_water = self.guard.high_water(),
                "transcript store returned a non-increasing sequence"
            );
        }
        let index = self.ctx.record_persisted();
        debug!(
            index,
            sequence = persisted.sequence,
            role = %persisted.role,
            "message persisted"
        );
        self.messages.push(persisted);
        Ok(())
    }

    fn notify(&mut self, event: LiveEvent) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        match live.send(event) {
            Ok(()) => {}
            Err(LiveError::Backpressure) => debug!("live consumer lagging, event dropped"),
            Err(LiveError::Disconnected) => {
                info!("live consumer disconnected, continuing without it");
                self.live = None;
            }
        }
    }
}

/// Cut `output` to at most `max_chars` characters, marking the cut.
pub(crate) fn truncate_output(output: String, max_chars: usize) -> String {
    match output.char_indices().nth(max_chars) {
        None => output,
        Some((byte, _)) => {
            let omitted = output[byte..].chars().count();
            format!("{}… [{omitted} more chars]", &output[..byte])
        }
    }
}
