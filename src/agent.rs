//! An event source backed by a model and a tool registry.
//!
//! Each reasoning cycle is one inference call. A cycle that asks for tools
//! yields its `ToolStart`s and a `ToolBatchEnd`, and only runs the tools once
//! the consumer pulls the next event. Since the orchestrator persists the
//! batch before pulling again, no tool executes before its call is in the
//! transcript.

use std::sync::Arc;

use async_stream::stream;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::events::{EventStream, TurnEvent};
use crate::inference::InferenceProvider;
use crate::message::Message;
use crate::tools::ToolRegistry;
use crate::types::{InferenceRequest, StopReason, Usage};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Inference calls allowed per turn before the source gives up.
    pub max_cycles: usize,
    pub system: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            max_tokens: 1024,
            max_cycles: 10,
            system: None,
        }
    }
}

impl AgentConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_cycles(mut self, cycles: usize) -> Self {
        self.max_cycles = cycles;
        self
    }
}

/// Produces one turn's events by running the model against the tools.
#[derive(Clone)]
pub struct AgentSource {
    provider: Arc<dyn InferenceProvider>,
    tools: Arc<ToolRegistry>,
    config: Arc<AgentConfig>,
}

impl AgentSource {
    pub fn new(
        provider: impl InferenceProvider + 'static,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider: Arc::new(provider),
            tools: Arc::new(tools),
            config: Arc::new(config),
        }
    }

    /// Events answering `prompt` after `history`, which holds raw transcript
    /// messages in order. Entries that are not valid chat messages are
    /// skipped.
    pub fn events(&self, history: Vec<Value>, prompt: &str) -> EventStream {
        let provider = self.provider.clone();
        let tools = self.tools.clone();
        let config = self.config.clone();

        let mut messages: Vec<Value> = history
            .into_iter()
            .filter(|raw| match Message::from_raw(raw) {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "dropping invalid history message");
                    false
                }
            })
            .collect();
        messages.push(json!({ "role": "user", "content": prompt }));

        Box::pin(stream! {
            let mut usage = Usage::default();

            for cycle in 0..config.max_cycles {
                let request = InferenceRequest {
                    model: config.model.clone(),
                    max_tokens: config.max_tokens,
                    system: config.system.clone(),
                    tools: tools.schemas(),
                    messages: messages.clone(),
                };

                let response = match provider.infer(request).await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(cycle, error = %e, "inference failed");
                        yield Err(SourceError::from(e));
                        return;
                    }
                };
                usage.accumulate(&response.usage);
                debug!(cycle, stop_reason = ?response.stop_reason, "cycle finished");

                let text = response.text();
                if !text.is_empty() {
                    yield Ok(TurnEvent::token(text.clone()));
                }

                match response.stop_reason {
                    StopReason::EndTurn => {
                        info!(
                            cycles = cycle + 1,
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "agent finished"
                        );
                        yield Ok(TurnEvent::model_end(None));
                        return;
                    }
                    StopReason::MaxTokens => {
                        debug!(cycle, "response cut at max_tokens, continuing");
                        messages.push(json!({ "role": "assistant", "content": text }));
                    }
                    StopReason::ToolUse => {
                        let uses: Vec<(String, String, Value)> = response
                            .tool_uses()
                            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                            .collect();
                        if uses.is_empty() {
                            warn!(cycle, "tool_use stop without tool calls, ending turn");
                            yield Ok(TurnEvent::model_end(None));
                            return;
                        }

                        let run_ids: Vec<String> =
                            (0..uses.len()).map(|i| format!("run-{cycle}-{i}")).collect();
                        for ((_, name, input), run_id) in uses.iter().zip(&run_ids) {
                            yield Ok(TurnEvent::tool_start(run_id.clone(), name.clone(), input.clone()));
                        }
                        yield Ok(TurnEvent::ToolBatchEnd);
                        yield Ok(TurnEvent::model_end(None));

                        let tool_calls: Vec<Value> = uses
                            .iter()
                            .map(|(id, name, input)| {
                                json!({
                                    "id": id,
                                    "type": "function",
                                    "function": { "name": name, "arguments": input.to_string() },
                                })
                            })
                            .collect();
                        let content = if text.is_empty() { Value::Null } else { Value::String(text) };
                        messages.push(json!({
                            "role": "assistant",
                            "content": content,
                            "tool_calls": tool_calls,
                        }));

                        let results = futures::future::join_all(
                            uses.iter().map(|(_, name, input)| tools.execute(name, input)),
                        )
                        .await;

                        for (((id, name, _), run_id), result) in uses.iter().zip(&run_ids).zip(results) {
                            let output = match result {
                                Ok(output) => output,
                                Err(e) => {
                                    debug!(tool = %name, error = %e, "tool failed");
                                    format!("error: {e}")
                                }
                            };
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": id,
                                "content": output,
                            }));
                            yield Ok(TurnEvent::tool_end(run_id.clone(), output));
                        }
                    }
                }
            }

            warn!(max_cycles = config.max_cycles, "agent hit its cycle limit");
            yield Err(SourceError::CycleLimit(config.max_cycles));
        })
    }
}
