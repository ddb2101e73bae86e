use std::collections::{HashMap, VecDeque};
use std::path::Path;

use cortex_core::db::open_component_db;
use cortex_core::Result;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const LOSS_HISTORY_CAP: usize = 200;
const LOSS_WINDOW: usize = 20;
const RESPONSE_QUALITY_CAP: usize = 500;
const COMPONENT_CONTRIBUTION_CAP: usize = 200;
const COSINE_DECAY_STEPS: f64 = 5000.0;

/// Components this process manages the training of, registered by
/// default so stats are visible even before the first report comes in.
pub static MANAGED_COMPONENTS: &[&str] =
    &["micro_transformer", "moe", "conditional_gen", "knowledge_distillation", "response_generator", "intent_router", "word2vec"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Plateau,
    Degrading,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub name: String,
    pub base_lr: f64,
    pub current_lr: f64,
    pub lr_min: f64,
    pub lr_max: f64,
    pub loss_history: VecDeque<f32>,
    pub total_steps: u64,
    pub total_improvements: u64,
    pub plateau_count: u64,
    pub importance: f32,
    pub train_prob: f32,
    pub trend: Trend,
}

impl LearnerProfile {
    fn new(name: &str, base_lr: f64, importance: f32) -> Self {
        Self {
            name: name.to_string(),
            base_lr,
            current_lr: base_lr,
            lr_min: 1e-5,
            lr_max: 1e-2,
            loss_history: VecDeque::new(),
            total_steps: 0,
            total_improvements: 0,
            plateau_count: 0,
            importance,
            train_prob: 1.0,
            trend: Trend::Unknown,
        }
    }

    pub fn record_loss(&mut self, loss: f32) {
        self.loss_history.push_back(loss);
        if self.loss_history.len() > LOSS_HISTORY_CAP {
            self.loss_history.pop_front();
        }
        self.total_steps += 1;
        self.update_trend();
    }

    fn update_trend(&mut self) {
        if self.loss_history.len() < LOSS_WINDOW {
            self.trend = Trend::Unknown;
            return;
        }
        let n = self.loss_history.len();
        let recent: Vec<f32> = self.loss_history.iter().skip(n - LOSS_WINDOW).copied().collect();
        let older: Vec<f32> = if n >= LOSS_WINDOW * 2 {
            self.loss_history.iter().skip(n - LOSS_WINDOW * 2).take(LOSS_WINDOW).copied().collect()
        } else {
            self.loss_history.iter().take(LOSS_WINDOW).copied().collect()
        };

        let avg_recent = recent.iter().sum::<f32>() / recent.len() as f32;
        let avg_older = older.iter().sum::<f32>() / older.len() as f32;
        let ratio = avg_recent / (avg_older + 1e-10);

        if ratio < 0.95 {
            self.trend = Trend::Improving;
            self.total_improvements += 1;
        } else if ratio > 1.05 {
            self.trend = Trend::Degrading;
        } else {
            self.trend = Trend::Plateau;
            self.plateau_count += 1;
        }
    }

    pub fn avg_recent_loss(&self) -> f32 {
        if self.loss_history.is_empty() {
            return f32::INFINITY;
        }
        let window = self.loss_history.len().min(10);
        let n = self.loss_history.len();
        self.loss_history.iter().skip(n - window).sum::<f32>() / window as f32
    }
}

/// Reduce-on-plateau plus warmup plus a cosine-annealing component,
/// blended rather than chosen between.
pub struct AdaptiveLrScheduler {
    warmup_steps: u64,
}

impl AdaptiveLrScheduler {
    pub fn new(warmup_steps: u64) -> Self {
        Self { warmup_steps }
    }

    pub fn step(&self, profile: &mut LearnerProfile) -> f64 {
        if profile.total_steps < self.warmup_steps {
            let warmup_factor = (profile.total_steps + 1) as f64 / self.warmup_steps as f64;
            profile.current_lr = profile.base_lr * warmup_factor;
            return profile.current_lr;
        }

        let mut lr = profile.current_lr;
        match profile.trend {
            Trend::Plateau => {
                lr *= 0.8;
                if profile.plateau_count > 3 {
                    lr *= 0.5;
                }
            }
            Trend::Degrading => lr *= 0.5,
            Trend::Improving => lr *= 1.05,
            Trend::Unknown => {}
        }

        let decay_steps = (profile.total_steps.saturating_sub(self.warmup_steps)).max(1) as f64;
        let cosine_factor = 0.5 * (1.0 + (std::f64::consts::PI * (decay_steps / COSINE_DECAY_STEPS).min(1.0)).cos());
        let cosine_lr = profile.lr_min + (profile.base_lr - profile.lr_min) * cosine_factor;

        lr = 0.7 * lr + 0.3 * cosine_lr;
        lr = lr.clamp(profile.lr_min, profile.lr_max);

        profile.current_lr = lr;
        lr
    }
}

impl Default for AdaptiveLrScheduler {
    fn default() -> Self {
        Self::new(50)
    }
}

/// Decides which components get trained on a given step: more to
/// improving ones, less to plateaued ones, with a small exploration
/// floor so nothing starves forever.
pub struct CurriculumScheduler {
    exploration_rate: f32,
    step: u64,
}

impl CurriculumScheduler {
    pub fn new(exploration_rate: f32) -> Self {
        Self { exploration_rate, step: 0 }
    }

    pub fn compute_train_probabilities(&mut self, profiles: &mut HashMap<String, LearnerProfile>) -> HashMap<String, f32> {
        self.step += 1;
        let mut probs = HashMap::with_capacity(profiles.len());
        for profile in profiles.values_mut() {
            let prob = self.compute_single_prob(profile);
            profile.train_prob = prob;
            probs.insert(profile.name.clone(), prob);
        }
        probs
    }

    fn compute_single_prob(&self, profile: &LearnerProfile) -> f32 {
        let mut base_prob = match profile.trend {
            Trend::Improving => 1.0,
            Trend::Plateau => 0.3,
            Trend::Degrading => 0.5,
            Trend::Unknown => 0.8,
        };
        base_prob *= profile.importance;

        if rand::rng().random::<f32>() < self.exploration_rate {
            base_prob = base_prob.max(0.5);
        }
        base_prob.clamp(0.05, 1.0)
    }

    pub fn should_train(&self, profile: &LearnerProfile) -> bool {
        rand::rng().random::<f32>() < profile.train_prob
    }
}

impl Default for CurriculumScheduler {
    fn default() -> Self {
        Self::new(0.1)
    }
}

/// Tracks overall response quality and each component's contribution
/// to it, the raw material `compute_importance` turns into scores.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    response_quality: VecDeque<f32>,
    tier_distribution: HashMap<String, u32>,
    component_contributions: HashMap<String, VecDeque<f32>>,
}

impl PerformanceTracker {
    pub fn record_response(&mut self, quality: f32, tier: &str, contributing_components: &[String]) {
        self.response_quality.push_back(quality);
        if self.response_quality.len() > RESPONSE_QUALITY_CAP {
            self.response_quality.pop_front();
        }
        *self.tier_distribution.entry(tier.to_string()).or_insert(0) += 1;

        for comp in contributing_components {
            let entry = self.component_contributions.entry(comp.clone()).or_default();
            entry.push_back(quality);
            if entry.len() > COMPONENT_CONTRIBUTION_CAP {
                entry.pop_front();
            }
        }
    }

    pub fn compute_importance(&self, profiles: &mut HashMap<String, LearnerProfile>) {
        for (name, profile) in profiles.iter_mut() {
            if let Some(contributions) = self.component_contributions.get(name) {
                if contributions.len() >= 5 {
                    let avg_quality = contributions.iter().sum::<f32>() / contributions.len() as f32;
                    let frequency = contributions.len() as f32 / self.response_quality.len().max(1) as f32;
                    profile.importance = 0.7 * avg_quality + 0.3 * frequency;
                    continue;
                }
            }
            profile.importance = 0.5;
        }
    }

    pub fn avg_quality(&self, window: usize) -> f32 {
        if self.response_quality.is_empty() {
            return 0.0;
        }
        let n = self.response_quality.len();
        let take = window.min(n);
        self.response_quality.iter().skip(n - take).sum::<f32>() / take as f32
    }

    pub fn quality_trend(&self) -> Trend {
        if self.response_quality.len() < 20 {
            return Trend::Unknown;
        }
        let n = self.response_quality.len();
        let recent: Vec<f32> = self.response_quality.iter().skip(n - 10).copied().collect();
        let older: Vec<f32> = self.response_quality.iter().skip(n - 20).take(10).copied().collect();
        let avg_r = recent.iter().sum::<f32>() / recent.len() as f32;
        let avg_o = older.iter().sum::<f32>() / older.len() as f32;
        if avg_r > avg_o * 1.05 {
            Trend::Improving
        } else if avg_r < avg_o * 0.95 {
            Trend::Degrading
        } else {
            Trend::Plateau
        }
    }

    pub fn stats(&self) -> PerformanceStats {
        PerformanceStats {
            avg_quality: self.avg_quality(50),
            quality_trend: self.quality_trend(),
            total_responses: self.response_quality.len() as u64,
            tier_distribution: self.tier_distribution.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerformanceStats {
    pub avg_quality: f32,
    pub quality_trend: Trend,
    pub total_responses: u64,
    pub tier_distribution: HashMap<String, u32>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    total_meta_steps: u64,
    profiles: HashMap<String, LearnerProfile>,
}

#[derive(Debug, Clone)]
pub struct MetaLearnerStats {
    pub total_meta_steps: u64,
    pub components: HashMap<String, LearnerProfile>,
    pub performance: PerformanceStats,
    pub recommendations: Vec<String>,
}

/// Learns how to teach every other learning component: tunes their
/// learning rates, decides how often each gets trained, and tracks
/// whether the system as a whole is improving.
pub struct MetaLearner {
    conn: rusqlite::Connection,
    profiles: HashMap<String, LearnerProfile>,
    lr_scheduler: AdaptiveLrScheduler,
    curriculum: CurriculumScheduler,
    performance: PerformanceTracker,
    total_meta_steps: u64,
}

impl MetaLearner {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_component_db(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                component TEXT,
                data TEXT,
                created_at TEXT NOT NULL
            );",
        )?;

        let mut learner = Self {
            conn,
            profiles: HashMap::new(),
            lr_scheduler: AdaptiveLrScheduler::default(),
            curriculum: CurriculumScheduler::default(),
            performance: PerformanceTracker::default(),
            total_meta_steps: 0,
        };
        learner.load_state()?;
        for comp in MANAGED_COMPONENTS {
            learner.register(comp, 3e-4, 1.0);
        }
        Ok(learner)
    }

    fn load_state(&mut self) -> Result<()> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta_state WHERE key = 'state'", [], |r| r.get(0))
            .optional()?;
        if let Some(raw) = raw {
            if let Ok(state) = serde_json::from_str::<PersistedState>(&raw) {
                self.total_meta_steps = state.total_meta_steps;
                self.profiles = state.profiles;
            }
        }
        Ok(())
    }

    fn save_state(&mut self) -> Result<()> {
        let state = PersistedState { total_meta_steps: self.total_meta_steps, profiles: self.profiles.clone() };
        let json_str = serde_json::to_string(&state)?;
        self.conn.execute(
            "INSERT INTO meta_state (key, value) VALUES ('state', ?1) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json_str],
        )?;
        Ok(())
    }

    pub fn register(&mut self, name: &str, base_lr: f64, importance: f32) {
        self.profiles.entry(name.to_string()).or_insert_with(|| LearnerProfile::new(name, base_lr, importance));
    }

    pub fn should_train(&self, component: &str) -> bool {
        match self.profiles.get(component) {
            Some(profile) => self.curriculum.should_train(profile),
            None => true,
        }
    }

    pub fn get_lr(&self, component: &str) -> f64 {
        self.profiles.get(component).map(|p| p.current_lr).unwrap_or(3e-4)
    }

    pub fn report_loss(&mut self, component: &str, loss: f32) {
        self.register(component, 3e-4, 1.0);
        let profile = self.profiles.get_mut(component).expect("just registered");
        profile.record_loss(loss);
        self.lr_scheduler.step(profile);
    }

    pub fn report_response(&mut self, quality: f32, tier: &str, components: &[String]) {
        self.performance.record_response(quality, tier, components);
    }

    /// One meta-optimization step: recomputes importance, training
    /// probabilities and learning rates, called periodically rather
    /// than on every request.
    pub fn optimize_step(&mut self) -> Result<()> {
        self.total_meta_steps += 1;

        self.performance.compute_importance(&mut self.profiles);
        self.curriculum.compute_train_probabilities(&mut self.profiles);
        for profile in self.profiles.values_mut() {
            self.lr_scheduler.step(profile);
        }

        if self.total_meta_steps % 10 == 0 {
            self.log_meta_state()?;
        }
        if self.total_meta_steps % 5 == 0 {
            self.save_state()?;
        }
        Ok(())
    }

    fn log_meta_state(&mut self) -> Result<()> {
        let improving = self.profiles.values().filter(|p| p.trend == Trend::Improving).count();
        let plateau = self.profiles.values().filter(|p| p.trend == Trend::Plateau).count();
        let degrading = self.profiles.values().filter(|p| p.trend == Trend::Degrading).count();
        let avg_q = self.performance.avg_quality(50);

        tracing::info!(step = self.total_meta_steps, quality = avg_q, improving, plateau, degrading, "meta-optimization step");
        for (name, profile) in &self.profiles {
            if profile.trend == Trend::Degrading {
                tracing::warn!(component = name, lr = profile.current_lr, loss = profile.avg_recent_loss(), "component is degrading");
            } else if profile.trend == Trend::Plateau && profile.plateau_count > 2 {
                tracing::info!(component = name, plateau_count = profile.plateau_count, "persistent plateau");
            }
        }

        let data = serde_json::json!({
            "step": self.total_meta_steps,
            "avg_quality": avg_q,
            "improving": improving,
            "plateau": plateau,
            "degrading": degrading,
        });
        self.conn.execute(
            "INSERT INTO meta_events (event_type, data, created_at) VALUES ('meta_step', ?1, ?2)",
            params![data.to_string(), now()],
        )?;
        Ok(())
    }

    pub fn recommendations(&self) -> Vec<String> {
        let mut recs = Vec::new();
        for (name, profile) in &self.profiles {
            if profile.trend == Trend::Degrading {
                recs.push(format!("{name}: degrading — lower the learning rate or add more training data"));
            } else if profile.trend == Trend::Plateau && profile.plateau_count > 5 {
                recs.push(format!("{name}: stuck on a long plateau — try a learning-rate restart"));
            }
        }

        match self.performance.quality_trend() {
            Trend::Degrading => recs.push("Overall quality is declining — check recent training data".to_string()),
            Trend::Improving => recs.push("Overall quality is improving — keep the current strategy".to_string()),
            _ => {}
        }

        if let Some(top) = self.profiles.values().max_by(|a, b| a.importance.partial_cmp(&b.importance).unwrap()) {
            if top.train_prob < 0.5 {
                recs.push(format!("{}: high importance but low train probability — give it more resources", top.name));
            }
        }
        recs
    }

    pub fn stats(&self) -> MetaLearnerStats {
        MetaLearnerStats {
            total_meta_steps: self.total_meta_steps,
            components: self.profiles.clone(),
            performance: self.performance.stats(),
            recommendations: self.recommendations(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        self.save_state()
    }
}

fn now() -> String {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MetaLearner, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (MetaLearner::open(&dir.path().join("meta.db")).unwrap(), dir)
    }

    #[test]
    fn registers_default_components() {
        let (learner, _dir) = setup();
        assert!(learner.profiles.contains_key("micro_transformer"));
        assert_eq!(learner.get_lr("micro_transformer"), 3e-4);
    }

    #[test]
    fn improving_loss_trend_raises_lr() {
        let (mut learner, _dir) = setup();
        learner.register("toy", 1e-3, 1.0);
        for i in 0..60 {
            let loss = 1.0 / (i as f32 + 1.0);
            learner.report_loss("toy", loss);
        }
        let profile = learner.profiles.get("toy").unwrap();
        assert_eq!(profile.trend, Trend::Improving);
    }

    #[test]
    fn optimize_step_updates_importance_and_persists() {
        let (mut learner, _dir) = setup();
        for _ in 0..6 {
            learner.report_response(0.9, "tier1", &["micro_transformer".to_string()]);
        }
        for _ in 0..5 {
            learner.optimize_step().unwrap();
        }
        let stats = learner.stats();
        assert_eq!(stats.total_meta_steps, 5);
        assert!(stats.components["micro_transformer"].importance > 0.0);
    }

    #[test]
    fn degrading_component_is_recommended_for_attention() {
        let (mut learner, _dir) = setup();
        learner.register("flaky", 1e-3, 1.0);
        for i in 0..60 {
            let loss = 1.0 + i as f32 * 0.1;
            learner.report_loss("flaky", loss);
        }
        let recs = learner.recommendations();
        assert!(recs.iter().any(|r| r.contains("flaky")));
    }
}
