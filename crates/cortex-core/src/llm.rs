use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::message::Message;

/// A tool call the LLM asked the orchestrator to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub num_ctx: Option<usize>,
    pub num_predict: Option<usize>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// The core's only view of a chat-capable LLM backend. Concrete
/// providers (HTTP APIs, local runtimes) live outside the core and are
/// injected at construction.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, messages: &[Message], opts: &ChatOptions) -> Result<ChatResponse>;

    /// Used by `DialogueMemory::maybe_compress`.
    async fn summarize(&self, prompt: &str) -> Result<String>;

    /// Used by `SelfPlay`; `format_hint` nudges providers that support
    /// strict JSON output modes.
    async fn judge(&self, prompt: &str, format_hint: &str) -> Result<String>;
}

/// The core's view of an external tool. Tool dispatch is open (a table
/// of `name -> tool object`), unlike the router's fixed tier dispatch.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> &ToolSchema;
    async fn invoke(&self, args: &HashMap<String, serde_json::Value>) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub required_args: Vec<String>,
    pub optional_args: Vec<String>,
    pub category: String,
    pub danger_level: u8,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub examples: Vec<String>,
}
