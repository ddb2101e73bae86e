use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use cortex_embeddings::{Level, SentenceEmbeddings, WordEmbeddings};

use crate::distillation::KnowledgeDistillation;

pub const DEFAULT_STRATEGY_FLOOR: f32 = 0.4;
pub const ANALOGY_SIM_FLOOR: f32 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtStep {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtChain {
    pub strategy: &'static str,
    pub steps: Vec<ThoughtStep>,
    pub answer: String,
    pub overall_confidence: f32,
    pub source_id: Option<i64>,
    pub is_template: bool,
}

/// A past chain kept around purely for the Analogy strategy, keyed by
/// the utterance it was produced for.
#[derive(Debug, Clone)]
pub struct PastChain {
    pub utterance: String,
    pub steps: Vec<String>,
    pub confidence: f32,
}

struct TaskFamily {
    name: &'static str,
    triggers: &'static [&'static str],
    template: &'static [&'static str],
}

static TASK_FAMILIES: Lazy<Vec<TaskFamily>> = Lazy::new(|| {
    vec![
        TaskFamily { name: "search", triggers: &["find", "search", "look up", "locate"], template: &["Identify the search target: {keywords}", "Query the available sources", "Summarize the findings"] },
        TaskFamily { name: "create", triggers: &["create", "make", "write", "generate"], template: &["Determine the target {file}", "Produce the content", "Save to {path}"] },
        TaskFamily { name: "analyze", triggers: &["analyze", "review", "inspect", "check"], template: &["Gather the relevant data", "Identify patterns or issues", "Report the conclusion"] },
        TaskFamily { name: "fix", triggers: &["fix", "debug", "repair", "resolve"], template: &["Reproduce the problem", "Locate the root cause", "Apply and verify the fix"] },
        TaskFamily { name: "configure", triggers: &["configure", "setup", "install", "set up"], template: &["Identify the required settings", "Apply the configuration", "Verify it took effect"] },
        TaskFamily { name: "transform", triggers: &["convert", "transform", "translate", "format"], template: &["Parse the input", "Apply the transformation", "Emit the output in {format}"] },
    ]
});

fn classify_task_family(utterance: &str) -> Option<&'static TaskFamily> {
    let lower = utterance.to_lowercase();
    TASK_FAMILIES.iter().find(|f| f.triggers.iter().any(|t| lower.contains(t)))
}

static ENTITY_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());
static ENTITY_FILE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[\w\-]+\.\w{1,5}\b").unwrap());
static ENTITY_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:[\w\-]+/)+[\w\-.]+|~[\w/\-.]+").unwrap());
static ENTITY_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(json|yaml|csv|xml|markdown|toml)\b").unwrap());

fn extract_entities(utterance: &str) -> HashMap<&'static str, String> {
    let mut entities = HashMap::new();
    if let Some(m) = ENTITY_FILE.find(utterance) {
        entities.insert("file", m.as_str().to_string());
    }
    if let Some(m) = ENTITY_PATH.find(utterance) {
        entities.insert("path", m.as_str().to_string());
    }
    if let Some(m) = ENTITY_NUMBER.find(utterance) {
        entities.insert("number", m.as_str().to_string());
    }
    if let Some(m) = ENTITY_FORMAT.find(utterance) {
        entities.insert("format", m.as_str().to_lowercase());
    }
    let keywords: String = utterance
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .take(4)
        .collect::<Vec<_>>()
        .join(" ");
    entities.insert("keywords", keywords);
    entities
}

/// ChainOfThought: template, then decompose, then analogy —
/// first strategy clearing `strategy_floor` wins.
pub struct ChainOfThought {
    strategy_floor: f32,
    past_chains: Vec<PastChain>,
}

impl ChainOfThought {
    pub fn new(strategy_floor: f32) -> Self {
        Self { strategy_floor, past_chains: Vec::new() }
    }

    pub fn record_useful_chain(&mut self, utterance: &str, steps: Vec<String>, confidence: f32) {
        self.past_chains.push(PastChain { utterance: utterance.to_string(), steps, confidence });
    }

    pub fn reason(
        &self,
        utterance: &str,
        intent: Option<&str>,
        kd: &mut KnowledgeDistillation,
        sentences: &mut SentenceEmbeddings,
        words: &mut WordEmbeddings,
    ) -> Option<ThoughtChain> {
        if let Some(chain) = self.try_template(utterance, intent, kd) {
            if chain.overall_confidence >= self.strategy_floor {
                return Some(chain);
            }
        }
        if let Some(chain) = self.try_decompose(utterance, kd) {
            if chain.overall_confidence >= self.strategy_floor {
                return Some(chain);
            }
        }
        if let Some(chain) = self.try_analogy(utterance, sentences, words) {
            if chain.overall_confidence >= self.strategy_floor {
                return Some(chain);
            }
        }
        None
    }

    fn try_template(&self, utterance: &str, intent: Option<&str>, kd: &mut KnowledgeDistillation) -> Option<ThoughtChain> {
        let found = kd.find_reasoning(utterance, intent).ok()??;
        let steps: Vec<ThoughtStep> = found.steps.iter().map(|s| ThoughtStep { text: s.clone() }).collect();
        let answer = steps.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join(" ");
        Some(ThoughtChain {
            strategy: "template",
            steps,
            answer,
            overall_confidence: 0.9 * found.confidence,
            source_id: Some(found.id),
            is_template: found.is_template,
        })
    }

    fn try_decompose(&self, utterance: &str, kd: &mut KnowledgeDistillation) -> Option<ThoughtChain> {
        let family = classify_task_family(utterance)?;
        let entities = extract_entities(utterance);

        let mut confidence = 0.5f32;
        for key in ["file", "path", "format", "number"] {
            if entities.get(key).map(|v| !v.is_empty()).unwrap_or(false) {
                confidence += 0.05;
            }
        }
        // rough KD corpus-size bonus without a dedicated count query
        if kd.find_reasoning(utterance, None).ok().flatten().is_some() {
            confidence += 0.05;
        }

        let steps: Vec<ThoughtStep> = family
            .template
            .iter()
            .map(|tpl| {
                let mut text = tpl.to_string();
                for (k, v) in &entities {
                    text = text.replace(&format!("{{{k}}}"), v);
                }
                ThoughtStep { text }
            })
            .collect();
        let answer = steps.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join(" ");

        Some(ThoughtChain {
            strategy: "decompose",
            steps,
            answer,
            overall_confidence: confidence.min(1.0),
            source_id: None,
            is_template: false,
        })
    }

    fn try_analogy(&self, utterance: &str, sentences: &mut SentenceEmbeddings, words: &mut WordEmbeddings) -> Option<ThoughtChain> {
        let query = sentences.encode(utterance, Level::Positional, words)?;
        let mut best: Option<(f32, &PastChain)> = None;
        for chain in &self.past_chains {
            let Some(v) = sentences.encode(&chain.utterance, Level::Positional, words) else { continue };
            let sim = cortex_core::math::cosine_similarity(&query, &v);
            if best.as_ref().map(|(s, _)| sim > *s).unwrap_or(true) {
                best = Some((sim, chain));
            }
        }
        let (sim, chain) = best?;
        if sim < ANALOGY_SIM_FLOOR {
            return None;
        }
        let steps: Vec<ThoughtStep> = chain.steps.iter().map(|s| ThoughtStep { text: s.clone() }).collect();
        let answer = steps.iter().map(|s| s.text.clone()).collect::<Vec<_>>().join(" ");
        Some(ThoughtChain {
            strategy: "analogy",
            steps,
            answer,
            overall_confidence: sim * chain.confidence * 0.8,
            source_id: None,
            is_template: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env() -> (tempfile::TempDir, KnowledgeDistillation, SentenceEmbeddings, WordEmbeddings) {
        let dir = tempdir().unwrap();
        let kd = KnowledgeDistillation::open(&dir.path().join("knowledge_distillation.db")).unwrap();
        let sentences = SentenceEmbeddings::open(&dir.path().join("sentence_embeddings.db"), 16).unwrap();
        let words = WordEmbeddings::open(&dir.path().join("word_embeddings.db"), 16).unwrap();
        (dir, kd, sentences, words)
    }

    #[test]
    fn decompose_classifies_fix_family() {
        let (_d, mut kd, mut sentences, mut words) = env();
        let cot = ChainOfThought::new(DEFAULT_STRATEGY_FLOOR);
        let chain = cot.reason("please fix the bug in main.rs", None, &mut kd, &mut sentences, &mut words).unwrap();
        assert_eq!(chain.strategy, "decompose");
    }

    #[test]
    fn template_strategy_wins_when_distillation_has_a_match() {
        let (_d, mut kd, mut sentences, mut words) = env();
        kd.distill("create file report.txt", "1. Create report.txt\n2. Write header", "create_file", true).unwrap();
        let cot = ChainOfThought::new(DEFAULT_STRATEGY_FLOOR);
        let chain = cot
            .reason("create file report.txt", Some("create_file"), &mut kd, &mut sentences, &mut words)
            .unwrap();
        assert_eq!(chain.strategy, "template");
    }

    #[test]
    fn analogy_requires_similarity_floor() {
        let (_d, mut kd, mut sentences, mut words) = env();
        let mut cot = ChainOfThought::new(0.99);
        cot.record_useful_chain("totally unrelated gibberish zz", vec!["do a thing".to_string()], 0.9);
        let chain = cot.reason("completely different topic", None, &mut kd, &mut sentences, &mut words);
        assert!(chain.is_none());
    }
}
