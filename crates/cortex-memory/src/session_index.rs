use once_cell::sync::Lazy;
use regex::Regex;

use cortex_core::math::cosine_similarity;

#[derive(Debug, Clone)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactCategory {
    Name,
    Age,
    Money,
    Decision,
    Location,
    Profession,
}

#[derive(Debug, Clone)]
pub struct ExtractedFact {
    pub category: FactCategory,
    pub value: String,
}

/// In-memory ordered list of session messages with per-message
/// embeddings, plus the facts extracted from them.
#[derive(Default)]
pub struct SessionIndex {
    messages: Vec<SessionMessage>,
    facts: Vec<ExtractedFact>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, role: &str, content: &str, embedding: Vec<f32>) {
        self.facts.extend(extract_facts(content));
        self.messages.push(SessionMessage { role: role.to_string(), content: content.to_string(), embedding });
    }

    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    pub fn facts(&self) -> &[ExtractedFact] {
        &self.facts
    }

    /// Cosine-ranked search with a small recency bonus
    /// `0.05 * index/max_index` favoring later messages.
    pub fn search(&self, query_embedding: &[f32], top_k: usize, min_score: f32) -> Vec<&SessionMessage> {
        if self.messages.is_empty() {
            return Vec::new();
        }
        let max_index = (self.messages.len() - 1).max(1) as f32;
        let mut scored: Vec<(f32, usize)> = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let sim = cosine_similarity(query_embedding, &m.embedding);
                let recency = 0.05 * (i as f32 / max_index);
                (sim + recency, i)
            })
            .filter(|(score, _)| *score >= min_score)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored.into_iter().map(|(_, i)| &self.messages[i]).collect()
    }
}

fn extract_facts(text: &str) -> Vec<ExtractedFact> {
    static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bmy name is ([A-Z][a-zA-Z]+)").unwrap());
    static AGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bi(?:'m| am) (\d{1,3}) years? old\b").unwrap());
    static MONEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[$€£]\s?\d+(?:[.,]\d+)?").unwrap());
    static DECISION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(i (?:decided|will|plan to|chose to) [^.!?]+)").unwrap());
    static LOCATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bi live in ([A-Z][a-zA-Z ]+)").unwrap());
    static PROFESSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bi(?:'m| am) a[n]? ([a-zA-Z ]+?)(?:\.|$)").unwrap());

    let mut out = Vec::new();
    if let Some(c) = NAME_RE.captures(text) {
        out.push(ExtractedFact { category: FactCategory::Name, value: c[1].to_string() });
    }
    if let Some(c) = AGE_RE.captures(text) {
        out.push(ExtractedFact { category: FactCategory::Age, value: c[1].to_string() });
    }
    if let Some(m) = MONEY_RE.find(text) {
        out.push(ExtractedFact { category: FactCategory::Money, value: m.as_str().to_string() });
    }
    if let Some(c) = DECISION_RE.captures(text) {
        out.push(ExtractedFact { category: FactCategory::Decision, value: c[1].trim().to_string() });
    }
    if let Some(c) = LOCATION_RE.captures(text) {
        out.push(ExtractedFact { category: FactCategory::Location, value: c[1].trim().to_string() });
    }
    if let Some(c) = PROFESSION_RE.captures(text) {
        out.push(ExtractedFact { category: FactCategory::Profession, value: c[1].trim().to_string() });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_prefers_later_message_on_tied_similarity() {
        let mut idx = SessionIndex::new();
        idx.add("user", "first", vec![1.0, 0.0]);
        idx.add("user", "second", vec![1.0, 0.0]);
        let hits = idx.search(&[1.0, 0.0], 1, 0.0);
        assert_eq!(hits[0].content, "second");
    }

    #[test]
    fn extracts_name_and_age() {
        let facts = extract_facts("Hi, my name is Alice. I'm 29 years old.");
        assert!(facts.iter().any(|f| matches!(f.category, FactCategory::Name) && f.value == "Alice"));
        assert!(facts.iter().any(|f| matches!(f.category, FactCategory::Age) && f.value == "29"));
    }

    #[test]
    fn min_score_filters_out_irrelevant_hits() {
        let mut idx = SessionIndex::new();
        idx.add("user", "unrelated", vec![0.0, 1.0]);
        let hits = idx.search(&[1.0, 0.0], 5, 0.5);
        assert!(hits.is_empty());
    }
}
