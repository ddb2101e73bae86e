//! DialogueMemory: sliding summary + session vector index +
//! fact extraction, assembled into an LLM-ready context budget.

mod session_index;
mod sliding_summary;

pub use session_index::{ExtractedFact, FactCategory, SessionIndex, SessionMessage};
pub use sliding_summary::{SlidingSummary, DEFAULT_MAX_SUMMARY_TOKENS, DEFAULT_WINDOW_SIZE};

use cortex_core::message::estimate_tokens_str;
use cortex_embeddings::{Level, SentenceEmbeddings, WordEmbeddings};

pub const DEFAULT_BUILD_CONTEXT_MAX_TOKENS: usize = 1800;

/// Facade combining the sliding summary, the session index, and the
/// token-budgeted context assembler the router hands to the LLM.
pub struct DialogueMemory {
    summary: SlidingSummary,
    index: SessionIndex,
    build_context_max_tokens: usize,
}

impl DialogueMemory {
    pub fn new(window_size: usize, max_summary_tokens: usize, build_context_max_tokens: usize) -> Self {
        Self {
            summary: SlidingSummary::new(window_size, max_summary_tokens),
            index: SessionIndex::new(),
            build_context_max_tokens,
        }
    }

    /// Adds a message, computing its embedding via the injected encoder.
    pub fn add(&mut self, role: &str, content: &str, sentences: &mut SentenceEmbeddings, words: &mut WordEmbeddings) {
        let embedding = sentences.encode(content, Level::Positional, words).unwrap_or_default();
        self.index.add(role, content, embedding);
        self.summary_push(role, content);
    }

    fn summary_push(&mut self, role: &str, content: &str) -> bool {
        self.summary.push(role, content)
    }

    /// Compresses the buffer if it has reached its window. A no-op
    /// otherwise.
    pub async fn maybe_compress<F, Fut>(&mut self, llm_summarizer: Option<F>)
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Option<String>>,
    {
        if self.summary.buffer().len() >= DEFAULT_WINDOW_SIZE {
            self.summary.compact(llm_summarizer).await;
        }
    }

    pub fn search_session(
        &mut self,
        query: &str,
        top_k: usize,
        min_score: f32,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Vec<&SessionMessage> {
        let Some(query_embedding) = sentences.encode(query, Level::Positional, words) else {
            return Vec::new();
        };
        self.index.search(&query_embedding, top_k, min_score)
    }

    /// Assembles LLM context in priority order, subject to a token
    /// budget: summary -> deduplicated facts -> semantic search hits
    /// (excluding the last few messages) -> recent messages verbatim.
    pub fn build_context(
        &mut self,
        user_input: &str,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> String {
        let budget = self.build_context_max_tokens;
        let mut used = 0usize;
        let mut parts: Vec<String> = Vec::new();

        if !self.summary.summary().is_empty() {
            let piece = format!("Summary: {}", self.summary.summary());
            used += estimate_tokens_str(&piece);
            parts.push(piece);
        }

        let mut seen_facts = std::collections::HashSet::new();
        let mut fact_lines = Vec::new();
        for fact in self.index.facts() {
            let key = format!("{:?}:{}", fact.category, fact.value);
            if seen_facts.insert(key) {
                fact_lines.push(format!("{:?}: {}", fact.category, fact.value));
            }
        }
        if !fact_lines.is_empty() {
            let piece = format!("Known facts: {}", fact_lines.join("; "));
            let cost = estimate_tokens_str(&piece);
            if used + cost <= budget {
                used += cost;
                parts.push(piece);
            }
        }

        let recent_exclude = DEFAULT_WINDOW_SIZE.min(self.index.messages().len());
        if let Some(query_embedding) = sentences.encode(user_input, Level::Positional, words) {
            let searchable_end = self.index.messages().len().saturating_sub(recent_exclude);
            if searchable_end > 0 {
                let hits = self.index.search(&query_embedding, 5, 0.2);
                for hit in hits {
                    let piece = format!("[{}]: {}", hit.role, hit.content);
                    let cost = estimate_tokens_str(&piece);
                    if used + cost > budget {
                        break;
                    }
                    used += cost;
                    parts.push(piece);
                }
            }
        }

        let tail_start = self.index.messages().len().saturating_sub(recent_exclude);
        for msg in &self.index.messages()[tail_start..] {
            let piece = format!("[{}]: {}", msg.role, msg.content);
            let cost = estimate_tokens_str(&piece);
            if used + cost > budget {
                break;
            }
            used += cost;
            parts.push(piece);
        }

        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn embedders() -> (tempfile::TempDir, SentenceEmbeddings, WordEmbeddings) {
        let dir = tempdir().unwrap();
        let sentences = SentenceEmbeddings::open(&dir.path().join("sentence_embeddings.db"), 16).unwrap();
        let words = WordEmbeddings::open(&dir.path().join("word_embeddings.db"), 16).unwrap();
        (dir, sentences, words)
    }

    #[test]
    fn build_context_includes_recent_messages() {
        let (_d, mut sentences, mut words) = embedders();
        let mut mem = DialogueMemory::new(DEFAULT_WINDOW_SIZE, DEFAULT_MAX_SUMMARY_TOKENS, DEFAULT_BUILD_CONTEXT_MAX_TOKENS);
        mem.add("user", "my name is Alice", &mut sentences, &mut words);
        mem.add("assistant", "nice to meet you Alice", &mut sentences, &mut words);
        let ctx = mem.build_context("what's my name", &mut sentences, &mut words);
        assert!(ctx.contains("Alice"));
    }

    #[test]
    fn facts_are_deduplicated_in_context() {
        let (_d, mut sentences, mut words) = embedders();
        let mut mem = DialogueMemory::new(DEFAULT_WINDOW_SIZE, DEFAULT_MAX_SUMMARY_TOKENS, DEFAULT_BUILD_CONTEXT_MAX_TOKENS);
        mem.add("user", "my name is Alice", &mut sentences, &mut words);
        mem.add("user", "my name is Alice", &mut sentences, &mut words);
        let ctx = mem.build_context("hi", &mut sentences, &mut words);
        assert_eq!(ctx.matches("Name: Alice").count(), 1);
    }
}
