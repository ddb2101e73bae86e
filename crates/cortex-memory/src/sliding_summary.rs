use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_WINDOW_SIZE: usize = 6;
pub const DEFAULT_MAX_SUMMARY_TOKENS: usize = 500;

static DECISION_VERBS: &[&str] = &["decided", "will", "should", "must", "chose", "agreed", "plan"];

/// Holds a running text summary plus a buffer of not-yet-compressed
/// recent messages. Compaction is triggered once the buffer reaches
/// `window_size`.
pub struct SlidingSummary {
    summary: String,
    buffer: Vec<(String, String)>,
    window_size: usize,
    max_summary_tokens: usize,
}

impl SlidingSummary {
    pub fn new(window_size: usize, max_summary_tokens: usize) -> Self {
        Self { summary: String::new(), buffer: Vec::new(), window_size, max_summary_tokens }
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn buffer(&self) -> &[(String, String)] {
        &self.buffer
    }

    /// Appends a message to the pending buffer. Returns `true` if the
    /// buffer reached `window_size` and a compaction is due.
    pub fn push(&mut self, role: &str, content: &str) -> bool {
        self.buffer.push((role.to_string(), content.to_string()));
        self.buffer.len() >= self.window_size
    }

    /// Compresses the older portion of the buffer, preferring an
    /// injected LLM summarizer and falling back to extractive
    /// scoring when none is available or it fails.
    pub async fn compact<F, Fut>(&mut self, llm_summarizer: Option<F>)
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Option<String>>,
    {
        if self.buffer.is_empty() {
            return;
        }
        let keep_tail = (self.buffer.len() / 3).max(1);
        let split = self.buffer.len().saturating_sub(keep_tail);
        let to_compress: Vec<_> = self.buffer.drain(..split).collect();
        if to_compress.is_empty() {
            return;
        }

        let joined: String = to_compress
            .iter()
            .map(|(role, text)| format!("[{role}]: {text}"))
            .collect::<Vec<_>>()
            .join("\n");

        let new_piece = if let Some(summarizer) = llm_summarizer {
            summarizer(joined.clone()).await.unwrap_or_else(|| Self::extractive_summary(&to_compress))
        } else {
            Self::extractive_summary(&to_compress)
        };

        if self.summary.is_empty() {
            self.summary = new_piece;
        } else {
            self.summary = format!("{} {}", self.summary, new_piece);
        }
        self.truncate_summary();
    }

    /// Scores sentences by presence of digits, proper nouns, question
    /// marks, and decision verbs; concatenates the top scorers up to a
    /// character budget.
    fn extractive_summary(messages: &[(String, String)]) -> String {
        static SENTENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.!?]+[.!?]?").unwrap());
        let mut scored: Vec<(i32, String)> = Vec::new();

        for (_, text) in messages {
            for sent in SENTENCE_RE.find_iter(text) {
                let s = sent.as_str().trim();
                if s.is_empty() {
                    continue;
                }
                let mut score = 0;
                if s.chars().any(|c| c.is_ascii_digit()) {
                    score += 2;
                }
                if s.contains('?') {
                    score += 1;
                }
                if s.split_whitespace().any(|w| w.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)) {
                    score += 1;
                }
                let lower = s.to_lowercase();
                if DECISION_VERBS.iter().any(|v| lower.contains(v)) {
                    score += 2;
                }
                scored.push((score, s.to_string()));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        let mut out = String::new();
        const CHAR_BUDGET: usize = 1500;
        for (_, sent) in scored {
            if out.len() + sent.len() > CHAR_BUDGET {
                break;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&sent);
        }
        if out.is_empty() {
            format!("[{} earlier messages]", messages.len())
        } else {
            out
        }
    }

    fn truncate_summary(&mut self) {
        // ~4 chars/token heuristic, consistent with Message::estimate_tokens.
        let char_budget = self.max_summary_tokens * 4;
        if self.summary.len() > char_budget {
            let cut = self.summary.char_indices().nth(char_budget).map(|(i, _)| i).unwrap_or(self.summary.len());
            self.summary.truncate(cut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_signals_compaction_at_window_size() {
        let mut s = SlidingSummary::new(3, DEFAULT_MAX_SUMMARY_TOKENS);
        assert!(!s.push("user", "hi"));
        assert!(!s.push("assistant", "hello"));
        assert!(s.push("user", "how are you"));
    }

    #[tokio::test]
    async fn extractive_fallback_prefers_sentences_with_numbers_and_questions() {
        let mut s = SlidingSummary::new(2, DEFAULT_MAX_SUMMARY_TOKENS);
        s.push("user", "The meeting is at 3pm. I think it's fine.");
        s.push("user", "What time works for you?");
        let none: Option<fn(String) -> std::future::Ready<Option<String>>> = None;
        s.compact(none).await;
        assert!(s.summary().contains("3pm") || s.summary().contains("?"));
    }

    #[tokio::test]
    async fn summary_is_capped_to_token_budget() {
        let mut s = SlidingSummary::new(1, 5);
        let long = "word ".repeat(500);
        s.push("user", &long);
        let none: Option<fn(String) -> std::future::Ready<Option<String>>> = None;
        s.compact(none).await;
        assert!(s.summary().len() <= 5 * 4 + 1);
    }
}
