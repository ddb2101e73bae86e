pub mod db;
pub mod error;
pub mod llm;
pub mod math;
pub mod message;

pub use error::{CoreError, Result};
pub use llm::{ChatOptions, ChatResponse, LlmProvider, ToolCall, ToolExecutor, ToolSchema};
pub use message::{Message, Role};
