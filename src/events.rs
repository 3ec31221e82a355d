use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

use crate::error::SourceError;

/// Events emitted by an event source during one turn, in causal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    ModelToken {
        text: String,
    },
    /// `run_id` is the source's correlation key; the transcript call id is
    /// minted by the turn context.
    ToolStart {
        run_id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    /// Every tool call of the current decision has been announced.
    ToolBatchEnd,
    ToolEnd {
        run_id: String,
        #[serde(default, deserialize_with = "output_text")]
        output: String,
    },
    /// The model finished the current reasoning cycle. `output`, when present,
    /// is the full text of the cycle.
    ModelEnd {
        #[serde(default)]
        output: Option<String>,
    },
}

impl TurnEvent {
    pub fn token(text: impl Into<String>) -> Self {
        Self::ModelToken { text: text.into() }
    }

    pub fn tool_start(run_id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolStart {
            run_id: run_id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_end(run_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ToolEnd {
            run_id: run_id.into(),
            output: output.into(),
        }
    }

    pub fn model_end(output: Option<&str>) -> Self {
        Self::ModelEnd {
            output: output.map(str::to_string),
        }
    }

    /// Decode one NDJSON line.
    pub fn decode(line: &str) -> Result<Self, SourceError> {
        serde_json::from_str(line).map_err(|e| SourceError::Decode(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelToken { .. } => "model_token",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolBatchEnd => "tool_batch_end",
            Self::ToolEnd { .. } => "tool_end",
            Self::ModelEnd { .. } => "model_end",
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<TurnEvent, SourceError>> + Send>>;

/// Tool outputs arrive as arbitrary JSON from some runtimes. Strings pass
/// through, message-like objects contribute their `content`, anything else is
/// rendered as compact JSON.
fn output_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        Value::Object(map) => match map.get("content").and_then(Value::as_str) {
            Some(content) => content.to_string(),
            None => Value::Object(map).to_string(),
        },
        other => other.to_string(),
    })
}

/// Read newline-delimited JSON events. Blank lines are skipped; a line that
/// fails to decode ends the stream with a [`SourceError::Decode`].
pub fn from_ndjson<R>(reader: R) -> EventStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match TurnEvent::decode(line) {
                        Ok(event) => yield Ok(event),
                        Err(e) => {
                            debug!(error = %e, "undecodable event line");
                            yield Err(e);
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    yield Err(SourceError::Disconnected(e.to_string()));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn decodes_tagged_events() {
        let event = TurnEvent::decode(
            r#"{"event":"tool_start","run_id":"r1","name":"search","input":{"q":"refund"}}"#,
        )
        .unwrap();
        assert_eq!(event, TurnEvent::tool_start("r1", "search", json!({"q": "refund"})));

        let event = TurnEvent::decode(r#"{"event":"model_end"}"#).unwrap();
        assert_eq!(event, TurnEvent::ModelEnd { output: None });

        let event = TurnEvent::decode(r#"{"event":"tool_batch_end"}"#).unwrap();
        assert_eq!(event, TurnEvent::ToolBatchEnd);
    }

    #[test]
    fn tool_output_is_flattened_to_text() {
        let event =
            TurnEvent::decode(r#"{"event":"tool_end","run_id":"r1","output":{"content":"found"}}"#)
                .unwrap();
        assert_eq!(event, TurnEvent::tool_end("r1", "found"));

        let event =
            TurnEvent::decode(r#"{"event":"tool_end","run_id":"r1","output":[1,2]}"#).unwrap();
        assert_eq!(event, TurnEvent::tool_end("r1", "[1,2]"));

        let event = TurnEvent::decode(
            r#"{"event":"tool_end","run_id":"r1","output":{"content":[{"type":"text","text":"found"}]}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            TurnEvent::tool_end("r1", r#"{"content":[{"text":"found","type":"text"}]}"#)
        );
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let err = TurnEvent::decode(r#"{"event":"chain_start"}"#).unwrap_err();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[tokio::test]
    async fn ndjson_stream_stops_at_bad_line() {
        let input = "{\"event\":\"model_token\",\"text\":\"Hi\"}\n\n{oops}\n{\"event\":\"model_end\"}\n";
        let events: Vec<_> = from_ndjson(input.as_bytes()).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap(), &TurnEvent::token("Hi"));
        assert!(matches!(events[1], Err(SourceError::Decode(_))));
    }
}
