use async_trait::async_trait;
use serde_json::Value;

/// Runs one tool. `Err` text is reported back to the model as the result,
/// not raised.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<String, String>;
}

/// Schema sent to the model plus the handler that serves it.
pub struct ToolDef {
    pub name: String,
    pub schema: Value,
    pub(crate) handler: Box<dyn ToolHandler>,
}
