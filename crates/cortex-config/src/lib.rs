use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningSeverity {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for WarningSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self {
            WarningSeverity::Info => "ℹ️",
            WarningSeverity::Warning => "⚠️",
            WarningSeverity::Error => "❌",
        };
        write!(f, "{icon}")
    }
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub severity: WarningSeverity,
    pub component: String,
    pub message: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}] {}", self.severity, self.component, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    pub target_vocab_size: usize,
    pub min_pair_freq: u32,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self { target_vocab_size: 8000, min_pair_freq: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub dim: usize,
    pub max_window: usize,
    pub negative_samples: usize,
    pub lr_max: f32,
    pub lr_min: f32,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self { dim: 128, max_window: 5, negative_samples: 5, lr_max: 0.025, lr_min: 0.0001 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub tier1_min_confidence: f32,
    pub tier25_threshold: f32,
    pub learned_find_min_confidence: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self { tier1_min_confidence: 0.7, tier25_threshold: 0.72, learned_find_min_confidence: 0.6 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub window_size: usize,
    pub max_summary_tokens: usize,
    pub build_context_max_tokens: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { window_size: 6, max_summary_tokens: 500, build_context_max_tokens: 1800 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveLearningConfig {
    pub sure_threshold: f32,
    pub hedged_threshold: f32,
    pub ask_threshold: f32,
}

impl Default for ActiveLearningConfig {
    fn default() -> Self {
        Self { sure_threshold: 0.80, hedged_threshold: 0.50, ask_threshold: 0.30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfPlayConfig {
    pub score_threshold: f32,
    pub exam_pass_rate_for_raise: f32,
}

impl Default for SelfPlayConfig {
    fn default() -> Self {
        Self { score_threshold: 6.0, exam_pass_rate_for_raise: 0.80 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaLearnerConfig {
    pub warmup_steps: u32,
    pub lr_min: f32,
    pub lr_max: f32,
    pub exploration_rate: f32,
}

impl Default for MetaLearnerConfig {
    fn default() -> Self {
        Self { warmup_steps: 100, lr_min: 0.0001, lr_max: 0.1, exploration_rate: 0.1 }
    }
}

/// Aggregate configuration for the whole router core. One sub-struct
/// per component family, each with reference defaults named throughout
/// the component design; loaded from an optional TOML file and
/// overridable by environment at the call site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CortexConfig {
    pub data_dir: PathBuf,
    pub tokenizer: TokenizerConfig,
    pub embeddings: EmbeddingsConfig,
    pub routing: RoutingConfig,
    pub memory: MemoryConfig,
    pub active_learning: ActiveLearningConfig,
    pub self_play: SelfPlayConfig,
    pub meta_learner: MetaLearnerConfig,
}

impl Default for CortexConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cortex-router");
        Self {
            data_dir,
            tokenizer: TokenizerConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            routing: RoutingConfig::default(),
            memory: MemoryConfig::default(),
            active_learning: ActiveLearningConfig::default(),
            self_play: SelfPlayConfig::default(),
            meta_learner: MetaLearnerConfig::default(),
        }
    }
}

impl CortexConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, toml::de::Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn db_path(&self, component: &str) -> PathBuf {
        self.data_dir.join(format!("{component}.db"))
    }

    /// Non-fatal sanity checks over the resolved configuration. Callers
    /// decide whether `Error`-severity warnings should abort startup;
    /// the config itself never refuses to construct.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.tokenizer.target_vocab_size < 260 {
            warnings.push(ConfigWarning {
                severity: WarningSeverity::Error,
                component: "tokenizer".into(),
                message: "target_vocab_size must be large enough to hold the base alphabet and specials".into(),
            });
        }

        if self.embeddings.lr_min > self.embeddings.lr_max {
            warnings.push(ConfigWarning {
                severity: WarningSeverity::Error,
                component: "embeddings".into(),
                message: "lr_min must not exceed lr_max".into(),
            });
        }

        for (name, v) in [
            ("routing.tier1_min_confidence", self.routing.tier1_min_confidence),
            ("routing.tier25_threshold", self.routing.tier25_threshold),
            ("active_learning.sure_threshold", self.active_learning.sure_threshold),
            ("active_learning.hedged_threshold", self.active_learning.hedged_threshold),
            ("active_learning.ask_threshold", self.active_learning.ask_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                warnings.push(ConfigWarning {
                    severity: WarningSeverity::Error,
                    component: "thresholds".into(),
                    message: format!("{name} = {v} is outside [0,1]"),
                });
            }
        }

        if self.active_learning.ask_threshold >= self.active_learning.hedged_threshold
            || self.active_learning.hedged_threshold >= self.active_learning.sure_threshold
        {
            warnings.push(ConfigWarning {
                severity: WarningSeverity::Warning,
                component: "active_learning".into(),
                message: "expected ask_threshold < hedged_threshold < sure_threshold".into(),
            });
        }

        if self.memory.max_summary_tokens >= self.memory.build_context_max_tokens {
            warnings.push(ConfigWarning {
                severity: WarningSeverity::Warning,
                component: "memory".into(),
                message: "max_summary_tokens should leave headroom under build_context_max_tokens".into(),
            });
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let cfg = CortexConfig::default();
        let warnings = cfg.validate();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    #[test]
    fn out_of_range_threshold_is_flagged() {
        let mut cfg = CortexConfig::default();
        cfg.routing.tier25_threshold = 1.5;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.severity == WarningSeverity::Error));
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let cfg = CortexConfig::load(std::path::Path::new("/nonexistent/cortex.toml")).unwrap();
        assert_eq!(cfg.tokenizer.target_vocab_size, 8000);
    }
}
