pub mod handler;
pub mod knowledge;
pub mod registry;

pub use handler::{ToolDef, ToolHandler};
pub use knowledge::{KnowledgeBase, QaPair};
pub use registry::ToolRegistry;
