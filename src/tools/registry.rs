use serde_json::Value;
use tracing::debug;

use super::handler::{ToolDef, ToolHandler};

/// The tools an agent source may call, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. `schema` is `{name, description, input_schema}`.
    /// A later registration under the same name replaces the earlier one.
    pub fn add(
        mut self,
        name: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        let name = name.into();
        self.tools.retain(|t| t.name != name);
        self.tools.push(ToolDef {
            name,
            schema,
            handler: Box::new(handler),
        });
        self
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Run `name` with `input`. Unknown tools are an error result, the same
    /// as a failing handler.
    pub async fn execute(&self, name: &str, input: &Value) -> Result<String, String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| format!("unknown tool: {name}"))?;
        debug!(tool = name, "executing tool");
        tool.handler.call(input).await
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}
