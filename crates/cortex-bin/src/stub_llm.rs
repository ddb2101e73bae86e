use async_trait::async_trait;
use cortex_core::{ChatOptions, ChatResponse, LlmProvider, Message, Result};

/// A non-networked stand-in for a real LLM backend, used only for
/// local inspection — `cortex route`'s tier-3 preview and `cortex
/// exam`'s non-LLM answer generator. Never call this in place of a
/// real provider outside this binary.
pub struct StubProvider;

impl StubProvider {
    pub fn canned_reply(&self, prompt: &str) -> String {
        let words = prompt.split_whitespace().count();
        format!("(stub) acknowledged a {words}-word prompt: {prompt}")
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, messages: &[Message], _opts: &ChatOptions) -> Result<ChatResponse> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(ChatResponse { content: self.canned_reply(last), tool_calls: Vec::new() })
    }

    async fn summarize(&self, prompt: &str) -> Result<String> {
        Ok(self.canned_reply(prompt))
    }

    async fn judge(&self, _prompt: &str, _format_hint: &str) -> Result<String> {
        Ok(r#"{"score": 7.0, "feedback": "stub judge, no real evaluation performed", "strengths": [], "weaknesses": [], "correct_answer": null}"#.to_string())
    }
}
