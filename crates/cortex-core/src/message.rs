use serde::{Deserialize, Serialize};

/// Who produced a chat turn passed to an injected LLM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn in a `chat(messages, opts)` call to an injected LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// `chars/4` heuristic, matching how the rest of the core estimates
    /// token budgets without a real tokenizer in the loop.
    pub fn estimate_tokens(&self) -> usize {
        estimate_tokens_str(&self.content)
    }
}

/// Same `chars/4` heuristic as [`Message::estimate_tokens`], exposed
/// for callers budgeting raw text that isn't wrapped in a `Message`
/// (context assembly, summaries).
pub fn estimate_tokens_str(text: &str) -> usize {
    (text.len() / 4).max(1) + 4
}
