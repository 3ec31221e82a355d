//! Transcript messages and their chat-completion wire form.
//!
//! Every message the assembler persists carries a `raw_message` that can be
//! replayed verbatim into any OpenAI-compatible chat API, so the structured
//! form here and the raw form must round-trip without losing a field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MessageError;

/// A tool invocation decided by the model. Owned by exactly one
/// [`Message::AssistantToolCalls`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, as the chat-completion schema requires.
    pub arguments: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    User { content: String },
    /// The model's decision to call tools, made before it sees their results.
    AssistantToolCalls { tool_calls: Vec<ToolCall> },
    ToolResult { tool_call_id: String, content: String },
    /// The user-visible answer. Always the last message of a complete turn.
    AssistantFinal { content: String },
}

impl Message {
    pub fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::AssistantToolCalls { .. } | Self::AssistantFinal { .. } => Role::Assistant,
            Self::ToolResult { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::User { content }
            | Self::ToolResult { content, .. }
            | Self::AssistantFinal { content } => Some(content),
            Self::AssistantToolCalls { .. } => None,
        }
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::AssistantFinal { .. })
    }

    /// The chat-completion form stored alongside the message.
    pub fn to_raw(&self) -> Value {
        let raw = match self {
            Self::User { content } => RawMessage::text(Role::User, content),
            Self::AssistantFinal { content } => RawMessage::text(Role::Assistant, content),
            Self::AssistantToolCalls { tool_calls } => RawMessage {
                role: Role::Assistant,
                content: None,
                tool_calls: Some(tool_calls.iter().map(RawToolCall::from).collect()),
                tool_call_id: None,
            },
            Self::ToolResult {
                tool_call_id,
                content,
            } => RawMessage {
                role: Role::Tool,
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: Some(tool_call_id.clone()),
            },
        };
        // A struct of strings and options always serializes.
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }

    /// Decode a stored raw message.
    pub fn from_raw(raw: &Value) -> Result<Self, MessageError> {
        let raw: RawMessage = serde_json::from_value(raw.clone())
            .map_err(|e| MessageError::Malformed(e.to_string()))?;

        match raw.role {
            Role::User => Ok(Self::User {
                content: raw.content.ok_or(MessageError::MissingField("content"))?,
            }),
            Role::Assistant => match raw.tool_calls {
                Some(calls) if !calls.is_empty() => Ok(Self::AssistantToolCalls {
                    tool_calls: calls.into_iter().map(ToolCall::from).collect(),
                }),
                _ => Ok(Self::AssistantFinal {
                    content: raw.content.unwrap_or_default(),
                }),
            },
            Role::Tool => Ok(Self::ToolResult {
                tool_call_id: raw
                    .tool_call_id
                    .ok_or(MessageError::MissingField("tool_call_id"))?,
                content: raw.content.unwrap_or_default(),
            }),
            Role::System => Err(MessageError::UnsupportedRole("system".into())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMessage {
    role: Role,
    // Tool-call messages carry an explicit `null` content.
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<RawToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl RawMessage {
    fn text(role: Role, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: RawFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".into()
}

impl From<&ToolCall> for RawToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            kind: function_kind(),
            function: RawFunction {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        }
    }
}

impl From<RawToolCall> for ToolCall {
    fn from(raw: RawToolCall) -> Self {
        Self {
            id: raw.id,
            name: raw.function.name,
            arguments: raw.function.arguments,
        }
    }
}
