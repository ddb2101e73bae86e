use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cortex_core::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::transformer::{MicroTransformer, D_MODEL};

pub const STYLE_VALUES: &[&str] = &["neutral", "formal", "technical", "casual"];
pub const MOOD_VALUES: &[&str] = &["neutral", "enthusiastic", "serious", "friendly"];
pub const TOPIC_VALUES: &[&str] = &["general", "code", "factual", "creative"];
pub const FORMAT_VALUES: &[&str] = &["prose", "list", "steps", "brief"];

const GENERATE_BIAS_FACTOR: f32 = 0.1;
const TRAIN_BIAS_FACTOR: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Style,
    Mood,
    Topic,
    Format,
}

fn values_for(axis: Axis) -> &'static [&'static str] {
    match axis {
        Axis::Style => STYLE_VALUES,
        Axis::Mood => MOOD_VALUES,
        Axis::Topic => TOPIC_VALUES,
        Axis::Format => FORMAT_VALUES,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Condition {
    pub style: Option<String>,
    pub mood: Option<String>,
    pub topic: Option<String>,
    pub format: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    vectors: HashMap<String, Vec<f32>>,
}

/// ConditionalGeneration: per-axis value vectors combined into
/// a conditioning vector that biases the transformer's output logits
/// and its sampling/postprocessing parameters.
pub struct ConditionalGeneration {
    path: PathBuf,
    vectors: HashMap<String, Vec<f32>>,
}

impl ConditionalGeneration {
    pub fn open(path: &Path) -> Result<Self> {
        let mut vectors = if let Ok(bytes) = std::fs::read(path) {
            serde_json::from_slice::<Snapshot>(&bytes).map(|s| s.vectors).unwrap_or_default()
        } else {
            HashMap::new()
        };
        let mut rng = rand::rng();
        for axis in [Axis::Style, Axis::Mood, Axis::Topic, Axis::Format] {
            for value in values_for(axis) {
                vectors.entry(value.to_string()).or_insert_with(|| (0..D_MODEL).map(|_| rng.random_range(-0.02..0.02)).collect());
            }
        }
        Ok(Self { path: path.to_path_buf(), vectors })
    }

    pub fn persist(&self) -> Result<()> {
        let snap = Snapshot { vectors: self.vectors.clone() };
        let bytes = serde_json::to_vec(&snap)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Normalized sum of the active axis values' vectors.
    pub fn conditioning_vector(&self, condition: &Condition) -> Vec<f32> {
        let mut sum = vec![0.0f32; D_MODEL];
        for value in [&condition.style, &condition.mood, &condition.topic, &condition.format].into_iter().flatten() {
            if let Some(v) = self.vectors.get(value) {
                for (s, vv) in sum.iter_mut().zip(v) {
                    *s += vv;
                }
            }
        }
        let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-9 {
            for s in sum.iter_mut() {
                *s /= norm;
            }
        }
        sum
    }

    /// Keyword-based per-axis condition detection from user input.
    pub fn detect_condition(text: &str) -> Condition {
        let lower = text.to_lowercase();
        let style = pick(&lower, &[("formal", &["formally", "professionally", "formal"]), ("technical", &["technical", "precisely", "in detail"]), ("casual", &["casually", "casual", "simply"])]);
        let mood = pick(&lower, &[("enthusiastic", &["excited", "awesome", "great", "love"]), ("serious", &["serious", "important", "urgent"]), ("friendly", &["please", "thanks", "friendly"])]);
        let topic = pick(&lower, &[("code", &["code", "function", "bug", "program"]), ("factual", &["what is", "define", "explain"]), ("creative", &["story", "poem", "imagine"])]);
        let format = pick(&lower, &[("list", &["list", "bullet"]), ("steps", &["steps", "step by step", "how to"]), ("brief", &["briefly", "short", "tl;dr"])]);
        Condition { style, mood, topic, format }
    }

    /// Adds the conditioning bias to the transformer's output bias for
    /// the duration of `f`, then restores the original bias.
    pub fn with_generation_bias<T>(&self, model: &mut MicroTransformer, condition: &Condition, f: impl FnOnce(&MicroTransformer) -> T) -> T {
        self.with_bias(model, condition, GENERATE_BIAS_FACTOR, f)
    }

    pub fn with_training_bias<T>(&self, model: &mut MicroTransformer, condition: &Condition, f: impl FnOnce(&mut MicroTransformer) -> T) -> T {
        let cond_vec = self.conditioning_vector(condition);
        let original = model.output_bias_mut().to_vec();
        {
            let bias = model.output_bias_mut();
            for (b, c) in bias.iter_mut().zip(project_to_vocab(&cond_vec, bias.len())) {
                *b += c * TRAIN_BIAS_FACTOR;
            }
        }
        let result = f(model);
        model.output_bias_mut().copy_from_slice(&original);
        result
    }

    fn with_bias<T>(&self, model: &mut MicroTransformer, condition: &Condition, factor: f32, f: impl FnOnce(&MicroTransformer) -> T) -> T {
        let cond_vec = self.conditioning_vector(condition);
        let original = model.output_bias_mut().to_vec();
        {
            let bias = model.output_bias_mut();
            for (b, c) in bias.iter_mut().zip(project_to_vocab(&cond_vec, bias.len())) {
                *b += c * factor;
            }
        }
        let result = f(model);
        model.output_bias_mut().copy_from_slice(&original);
        result
    }

    /// Condition-adjusted sampling temperature and max token length.
    pub fn sampling_params(condition: &Condition, base_temperature: f32, base_max_tokens: usize) -> (f32, usize) {
        let mut temperature = base_temperature;
        let mut max_tokens = base_max_tokens;
        match condition.style.as_deref() {
            Some("formal") | Some("technical") => temperature *= 0.7,
            _ => {}
        }
        if condition.mood.as_deref() == Some("enthusiastic") {
            temperature *= 1.2;
        }
        if condition.format.as_deref() == Some("brief") {
            max_tokens = max_tokens.min(60);
        }
        (temperature.clamp(0.1, 2.0), max_tokens)
    }

    /// Postprocesses decoded text per the active format condition.
    pub fn postprocess(condition: &Condition, text: &str) -> String {
        match condition.format.as_deref() {
            Some("list") => text
                .split('\n')
                .filter(|l| !l.trim().is_empty())
                .map(|l| format!("- {}", l.trim()))
                .collect::<Vec<_>>()
                .join("\n"),
            Some("steps") => text
                .split('\n')
                .filter(|l| !l.trim().is_empty())
                .enumerate()
                .map(|(i, l)| format!("{}. {}", i + 1, l.trim()))
                .collect::<Vec<_>>()
                .join("\n"),
            Some("brief") => text.chars().take(240).collect(),
            _ => text.to_string(),
        }
    }
}

fn pick(lower: &str, options: &[(&'static str, &[&str])]) -> Option<String> {
    options.iter().find(|(_, kws)| kws.iter().any(|k| lower.contains(k))).map(|(v, _)| v.to_string())
}

/// Projects the `D_MODEL`-sized conditioning vector into vocab space
/// via a cheap modular hash since the tied embedding matrix's rows are
/// already consumed for classification — a full `E · cond_vec`
/// projection is equivalent in shape, this avoids re-deriving it here.
fn project_to_vocab(cond_vec: &[f32], vocab_size: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; vocab_size];
    for (i, o) in out.iter_mut().enumerate() {
        *o = cond_vec[i % cond_vec.len()];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_technical_and_brief_condition() {
        let cond = ConditionalGeneration::detect_condition("explain this briefly and technically");
        assert_eq!(cond.style.as_deref(), Some("technical"));
        assert_eq!(cond.format.as_deref(), Some("brief"));
    }

    #[test]
    fn formal_style_lowers_temperature() {
        let cond = Condition { style: Some("formal".to_string()), ..Default::default() };
        let (t, _) = ConditionalGeneration::sampling_params(&cond, 1.0, 100);
        assert!(t < 1.0);
    }

    #[test]
    fn postprocess_numbers_steps() {
        let cond = Condition { format: Some("steps".to_string()), ..Default::default() };
        let out = ConditionalGeneration::postprocess(&cond, "do a\ndo b");
        assert!(out.starts_with("1. do a"));
    }

    #[test]
    fn generation_bias_is_restored_after_use() {
        let dir = tempdir().unwrap();
        let mut model = MicroTransformer::open(&dir.path().join("transformer.json"), 10).unwrap();
        let original = model.output_bias_mut().to_vec();
        let cg = ConditionalGeneration::open(&dir.path().join("conditional.json")).unwrap();
        let cond = Condition { style: Some("formal".to_string()), ..Default::default() };
        cg.with_generation_bias(&mut model, &cond, |_m| {});
        assert_eq!(model.output_bias_mut().to_vec(), original);
    }
}
