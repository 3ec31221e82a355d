//! Company knowledge base tools served by the conversation backend.
//!
//! `search_knowledge_base` posts to `/tools/search-qa`, `get_qa_by_ids` to
//! `/tools/get-qa-by-ids`. Both report failures as result text so the model
//! can adjust its next call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::handler::ToolHandler;
use super::registry::ToolRegistry;
use crate::error::SinkError;
use crate::transcript::http::read_body;
use crate::transcript::BackendTranscript;

const DEFAULT_LIMIT: u64 = 5;
const MAX_LIMIT: u64 = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QaPair {
    pub id: String,
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Deserialize)]
struct SearchQaResponse {
    #[serde(default)]
    qa_pairs: Vec<QaPair>,
    #[serde(default)]
    count: usize,
}

#[derive(Debug, Deserialize)]
struct QaPairsResponse {
    #[serde(default)]
    qa_pairs: Vec<QaPair>,
}

/// Client for the backend's Q&A endpoints.
#[derive(Clone)]
pub struct KnowledgeBase {
    client: reqwest::Client,
    base_url: String,
}

impl KnowledgeBase {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Share the transcript backend's client and address.
    pub fn from_backend(backend: &BackendTranscript) -> Self {
        Self {
            client: backend.client().clone(),
            base_url: backend.base_url().to_string(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Full-text search. `limit` is clamped to 1..=10.
    pub async fn search(&self, query: &str, limit: u64) -> Result<Vec<QaPair>, SinkError> {
        let body = self
            .post(
                "/tools/search-qa",
                json!({ "query": query, "limit": clamp_limit(limit) }),
            )
            .await?;
        let response: SearchQaResponse =
            serde_json::from_str(&body).map_err(|e| SinkError::Serialization(e.to_string()))?;
        debug!(query, count = response.count, "knowledge base search");
        if response.count == 0 {
            return Ok(Vec::new());
        }
        Ok(response.qa_pairs)
    }

    pub async fn get_by_ids(&self, ids: &[uuid::Uuid]) -> Result<Vec<QaPair>, SinkError> {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let body = self
            .post("/tools/get-qa-by-ids", json!({ "ids": ids }))
            .await?;
        let response: QaPairsResponse =
            serde_json::from_str(&body).map_err(|e| SinkError::Serialization(e.to_string()))?;
        Ok(response.qa_pairs)
    }

    async fn post(&self, path: &str, payload: Value) -> Result<String, SinkError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        read_body(resp).await
    }

    /// Add both tools to `registry`, search first.
    pub fn register(self, registry: ToolRegistry) -> ToolRegistry {
        let kb = Arc::new(self);
        registry
            .add(
                "search_knowledge_base",
                search_schema(),
                SearchKnowledgeBase(kb.clone()),
            )
            .add("get_qa_by_ids", get_by_ids_schema(), GetQaByIds(kb))
    }
}

fn clamp_limit(limit: u64) -> u64 {
    limit.clamp(1, MAX_LIMIT)
}

fn search_schema() -> Value {
    json!({
        "name": "search_knowledge_base",
        "description": "Search the company knowledge base for relevant Q&A pairs using full-text search. Use this first for any user question. If nothing useful comes back, try different keywords.",
        "input_schema": {
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query. Be specific with keywords."},
                "limit": {"type": "integer", "description": "Number of results to return (1-10)", "default": DEFAULT_LIMIT}
            },
            "required": ["query"]
        }
    })
}

fn get_by_ids_schema() -> Value {
    json!({
        "name": "get_qa_by_ids",
        "description": "Retrieve specific Q&A pairs by their IDs, e.g. ones returned by an earlier search.",
        "input_schema": {
            "type": "object",
            "properties": {
                "qa_ids": {"type": "array", "items": {"type": "string"}, "description": "Q&A pair UUIDs"}
            },
            "required": ["qa_ids"]
        }
    })
}

fn format_search(pairs: &[QaPair]) -> String {
    if pairs.is_empty() {
        return "No relevant information found in the knowledge base.".to_string();
    }
    pairs
        .iter()
        .enumerate()
        .map(|(i, qa)| {
            format!(
                "Result {}:\nQuestion: {}\nAnswer: {}\nID: {}",
                i + 1,
                qa.question,
                qa.answer,
                qa.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_by_ids(pairs: &[QaPair]) -> String {
    if pairs.is_empty() {
        return "No Q&A pairs found for the provided IDs.".to_string();
    }
    pairs
        .iter()
        .map(|qa| format!("ID: {}\nQuestion: {}\nAnswer: {}", qa.id, qa.question, qa.answer))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct SearchKnowledgeBase(Arc<KnowledgeBase>);

#[async_trait]
impl ToolHandler for SearchKnowledgeBase {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let Some(query) = input["query"].as_str() else {
            return Ok("Error searching knowledge base: missing query".to_string());
        };
        let limit = input["limit"].as_u64().unwrap_or(DEFAULT_LIMIT);
        Ok(match self.0.search(query, limit).await {
            Ok(pairs) => format_search(&pairs),
            Err(e) => format!("Error searching knowledge base: {e}"),
        })
    }
}

pub struct GetQaByIds(Arc<KnowledgeBase>);

#[async_trait]
impl ToolHandler for GetQaByIds {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let raw: Vec<&str> = input["qa_ids"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect();
        let ids = match raw
            .iter()
            .map(|id| uuid::Uuid::parse_str(id))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(ids) => ids,
            Err(e) => return Ok(format!("Invalid UUID format: {e}")),
        };
        Ok(match self.0.get_by_ids(&ids).await {
            Ok(pairs) => format_by_ids(&pairs),
            Err(e) => format!("Error retrieving Q&A pairs: {e}"),
        })
    }
}
