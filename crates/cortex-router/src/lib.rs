//! IntentRouter: four-tier routing cascade over an utterance —
//! learned patterns, deterministic rules, embedding classifier, LLM
//! fallback.

mod classifier;
mod rules;

use std::collections::HashMap;

pub use classifier::EmbeddingClassifier;

use cortex_embeddings::{Level, SentenceEmbeddings, WordEmbeddings};
use cortex_patterns::LearnedPatterns;

pub const DEFAULT_TIER1_MIN_CONFIDENCE: f32 = 0.7;
pub const DEFAULT_TIER25_THRESHOLD: f32 = 0.72;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSource {
    LearnedPattern,
    Rule,
    EmbeddingClassifier,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub intent: String,
    pub agent: String,
    pub confidence: f32,
    pub slots: HashMap<String, String>,
    pub source: RouteSource,
    pub pattern_id: Option<i64>,
}

pub struct IntentRouter {
    tier1_min_confidence: f32,
    classifier: EmbeddingClassifier,
}

impl IntentRouter {
    pub fn new(tier1_min_confidence: f32, tier25_threshold: f32) -> Self {
        Self { tier1_min_confidence, classifier: EmbeddingClassifier::new(tier25_threshold) }
    }

    /// Runs the cascade. Returns `None` only when every tier declines,
    /// signaling the caller to fall back to the LLM planner (Tier 3).
    pub fn route(
        &mut self,
        utterance: &str,
        patterns: &mut LearnedPatterns,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Option<RouteDecision> {
        if let Some(decision) = self.route_tier1(utterance, patterns) {
            return Some(decision);
        }
        if let Some(decision) = self.route_tier2(utterance, patterns) {
            return Some(decision);
        }
        if let Some(decision) = self.route_tier25(utterance, patterns, sentences, words) {
            return Some(decision);
        }
        None
    }

    fn route_tier1(&self, utterance: &str, patterns: &mut LearnedPatterns) -> Option<RouteDecision> {
        let m = patterns.find_routing(utterance, self.tier1_min_confidence).ok()??;
        let mut slots = patterns.find_slots(&m.intent, utterance).unwrap_or_default();
        for (k, v) in rules::extract_builtin_slots(&m.intent, utterance) {
            slots.entry(k).or_insert(v);
        }
        Some(RouteDecision {
            intent: m.intent,
            agent: m.agent,
            confidence: m.confidence,
            slots,
            source: RouteSource::LearnedPattern,
            pattern_id: Some(m.pattern_id),
        })
    }

    fn route_tier2(&self, utterance: &str, patterns: &mut LearnedPatterns) -> Option<RouteDecision> {
        for rule in rules::RULES.iter() {
            if !rule.pattern.is_match(utterance) {
                continue;
            }
            if rule.agent == "executor" && !rules::known_tools().contains(&rule.intent) {
                continue;
            }

            let mut slots = patterns.find_slots(rule.intent, utterance).unwrap_or_default();
            for (k, v) in rules::extract_builtin_slots(rule.intent, utterance) {
                slots.entry(k).or_insert(v);
            }

            let required = rules::required_slots(rule.intent);
            if required.iter().any(|s| !slots.contains_key(*s)) {
                // A required slot failed extraction: force escalation
                // rather than dispatching with missing arguments.
                continue;
            }

            return Some(RouteDecision {
                intent: rule.intent.to_string(),
                agent: rule.agent.to_string(),
                confidence: 1.0,
                slots,
                source: RouteSource::Rule,
                pattern_id: None,
            });
        }
        None
    }

    fn route_tier25(
        &self,
        utterance: &str,
        patterns: &mut LearnedPatterns,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Option<RouteDecision> {
        let vector = sentences.encode(utterance, Level::Positional, words)?;
        let (intent, sim) = self.classifier.classify(&vector)?;
        let agent = if rules::known_tools().contains(&intent.as_str()) {
            "executor".to_string()
        } else {
            rules::RULES
                .iter()
                .find(|r| r.intent == intent)
                .map(|r| r.agent.to_string())
                .unwrap_or_else(|| "dialogue".to_string())
        };

        let mut slots = patterns.find_slots(&intent, utterance).unwrap_or_default();
        for (k, v) in rules::extract_builtin_slots(&intent, utterance) {
            slots.entry(k).or_insert(v);
        }
        let required = rules::required_slots(&intent);
        if required.iter().any(|s| !slots.contains_key(*s)) {
            return None;
        }

        Some(RouteDecision { intent, agent, confidence: sim, slots, source: RouteSource::EmbeddingClassifier, pattern_id: None })
    }

    /// Called by the caller after a successful answer to update the
    /// Tier 2.5 centroids incrementally.
    pub fn learn_from_route(&mut self, intent: &str, vector: &[f32]) {
        self.classifier.add_example(intent, vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, LearnedPatterns, SentenceEmbeddings, WordEmbeddings) {
        let dir = tempdir().unwrap();
        let patterns = LearnedPatterns::open(&dir.path().join("learned_patterns.db")).unwrap();
        let sentences = SentenceEmbeddings::open(&dir.path().join("sentence_embeddings.db"), 16).unwrap();
        let words = WordEmbeddings::open(&dir.path().join("word_embeddings.db"), 16).unwrap();
        (dir, patterns, sentences, words)
    }

    #[test]
    fn tier2_rule_matches_greeting() {
        let (_d, mut patterns, mut sentences, mut words) = fresh();
        let mut router = IntentRouter::new(DEFAULT_TIER1_MIN_CONFIDENCE, DEFAULT_TIER25_THRESHOLD);
        let decision = router.route("hello there", &mut patterns, &mut sentences, &mut words).unwrap();
        assert_eq!(decision.intent, "greeting");
        assert_eq!(decision.source, RouteSource::Rule);
    }

    #[test]
    fn create_file_without_filepath_forces_escalation() {
        let (_d, mut patterns, mut sentences, mut words) = fresh();
        let mut router = IntentRouter::new(DEFAULT_TIER1_MIN_CONFIDENCE, DEFAULT_TIER25_THRESHOLD);
        let decision = router.route("please create a file", &mut patterns, &mut sentences, &mut words);
        assert!(decision.is_none());
    }

    #[test]
    fn create_file_with_filepath_routes_to_executor() {
        let (_d, mut patterns, mut sentences, mut words) = fresh();
        let mut router = IntentRouter::new(DEFAULT_TIER1_MIN_CONFIDENCE, DEFAULT_TIER25_THRESHOLD);
        let decision = router
            .route("create a file notes.txt", &mut patterns, &mut sentences, &mut words)
            .unwrap();
        assert_eq!(decision.intent, "create_file");
        assert_eq!(decision.agent, "executor");
        assert_eq!(decision.slots.get("filepath"), Some(&"notes.txt".to_string()));
    }

    #[test]
    fn learned_pattern_tier1_shadows_rules() {
        let (_d, mut patterns, mut sentences, mut words) = fresh();
        patterns.learn_routing("what's the forecast", "get_weather", "executor", "llm").unwrap();
        // Reinforce a few times to push confidence above the tier-1 bar.
        for _ in 0..10 {
            patterns.learn_routing("what's the forecast", "get_weather", "executor", "llm").unwrap();
        }
        let mut router = IntentRouter::new(0.5, DEFAULT_TIER25_THRESHOLD);
        let decision = router.route("what's the forecast", &mut patterns, &mut sentences, &mut words);
        assert!(decision.is_some());
        assert_eq!(decision.unwrap().source, RouteSource::LearnedPattern);
    }

    #[test]
    fn unmatched_utterance_falls_through_to_none() {
        let (_d, mut patterns, mut sentences, mut words) = fresh();
        let mut router = IntentRouter::new(DEFAULT_TIER1_MIN_CONFIDENCE, DEFAULT_TIER25_THRESHOLD);
        let decision = router.route("xyzzy plugh frobnicate", &mut patterns, &mut sentences, &mut words);
        assert!(decision.is_none());
    }
}
