use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::InferenceProvider;
use crate::error::InferenceError;
use crate::types::{ContentBlock, InferenceRequest, InferenceResponse, StopReason, Usage};

/// OpenAI-compatible provider. Works with any server exposing
/// `/v1/chat/completions` (OpenAI, vLLM, LM Studio, OpenRouter, Gemini's
/// OpenAI endpoint).
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Registry schemas are `{name, description, input_schema}`; the wire
    /// wants function-calling definitions.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let name = tool["name"].as_str()?;
                let parameters = tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                Some(json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": parameters,
                    }
                }))
            })
            .collect()
    }

    fn request_body(request: &InferenceRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(request.messages.iter().cloned());

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(Self::convert_tools(&request.tools));
        }
        body
    }

    fn parse_completion(parsed: &Value) -> Result<InferenceResponse, InferenceError> {
        let choice = parsed["choices"]
            .get(0)
            .ok_or_else(|| InferenceError::Parse("response has no choices".into()))?;

        let stop_reason = match choice["finish_reason"].as_str().unwrap_or("stop") {
            "stop" => StopReason::EndTurn,
            "tool_calls" | "function_call" => StopReason::ToolUse,
            "length" => StopReason::MaxTokens,
            other => {
                debug!(finish_reason = %other, "unknown finish_reason, treating as end of turn");
                StopReason::EndTurn
            }
        };

        let message = &choice["message"];
        let mut content = Vec::new();
        if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
            content.push(ContentBlock::Text(text.to_string()));
        }
        for call in message["tool_calls"].as_array().into_iter().flatten() {
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            content.push(ContentBlock::ToolUse {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                input: serde_json::from_str(arguments).unwrap_or_else(|_| json!({})),
            });
        }

        // Some servers report tool calls with finish_reason "stop".
        let stop_reason = if stop_reason == StopReason::EndTurn
            && content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }))
        {
            StopReason::ToolUse
        } else {
            stop_reason
        };

        let usage = Usage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(InferenceResponse {
            stop_reason,
            content,
            usage,
        })
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let body = Self::request_body(&request);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "chat completion request"
        );

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        if status != 200 {
            return Err(InferenceError::ApiError { status, body: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;
        Self::parse_completion(&parsed)
    }
}
