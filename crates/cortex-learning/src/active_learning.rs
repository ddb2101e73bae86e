use std::collections::HashMap;
use std::path::Path;

use cortex_core::db::open_component_db;
use cortex_core::Result;
use once_cell::sync::Lazy;
use rand::Rng;
use rusqlite::{params, OptionalExtension};

const DEFAULT_SURE: f32 = 0.80;
const DEFAULT_HEDGED: f32 = 0.50;
const DEFAULT_ASK: f32 = 0.30;
const ADJUSTMENT: f32 = 0.01;

static HEDGING_PHRASES: &[&str] = &[
    "If I've misunderstood, just let me know.",
    "Hopefully I've got this right.",
    "Tell me if you wanted something different.",
    "Correct me if I've misread this.",
];

static UNCERTAINTY_PHRASES: &[&str] = &[
    "I'm not entirely sure what you mean — can you clarify?",
    "I didn't quite follow. Can you say more?",
    "Could you rephrase that? I want to get this right.",
    "I need a bit more detail to do this properly.",
];

static INTENT_DESCRIPTIONS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("create_file", "create a file"),
        ("delete_file", "delete a file"),
        ("read_file", "read a file"),
        ("web_search", "search the web"),
        ("launch_app", "launch an application"),
        ("greeting", "just chat"),
        ("explanation", "explain something"),
        ("creative", "write something creative"),
    ]
    .into_iter()
    .collect()
});

static QUESTION_WORDS: &[&str] = &["what", "how", "where", "when", "why", "who", "which"];

#[derive(Debug, Clone)]
pub struct RouteSignal<'a> {
    pub confidence: f32,
    pub source: &'a str,
    pub intent: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Answer,
    Hedge,
    Clarify,
    Uncertain,
}

#[derive(Debug, Clone)]
pub struct Assessment {
    pub confidence: f32,
    pub action: Action,
    pub request_id: i64,
    pub phrase: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    sure: f32,
    hedged: f32,
    ask: f32,
}

/// Confidence-gated answering: aggregates several cheap signals into
/// a single confidence score and picks one of four actions, adapting
/// its thresholds from feedback on past decisions.
pub struct ActiveLearning {
    conn: rusqlite::Connection,
    thresholds: Thresholds,
    error_intents: HashMap<String, u32>,
}

impl ActiveLearning {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_component_db(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS confidence_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_input TEXT NOT NULL,
                intent TEXT,
                confidence REAL NOT NULL,
                action TEXT NOT NULL,
                was_correct INTEGER DEFAULT -1,
                route_source TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS thresholds (
                key TEXT PRIMARY KEY,
                value REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS intent_errors (
                intent TEXT PRIMARY KEY,
                error_count INTEGER DEFAULT 0,
                success_count INTEGER DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_conf_action ON confidence_log(action);",
        )?;

        let mut thresholds = Thresholds { sure: DEFAULT_SURE, hedged: DEFAULT_HEDGED, ask: DEFAULT_ASK };
        for (key, slot) in [("sure", &mut thresholds.sure), ("hedged", &mut thresholds.hedged), ("ask", &mut thresholds.ask)] {
            let value: Option<f64> = conn.query_row("SELECT value FROM thresholds WHERE key = ?1", params![key], |r| r.get(0)).optional()?;
            if let Some(v) = value {
                *slot = v as f32;
            }
        }

        let mut error_intents = HashMap::new();
        let mut stmt = conn.prepare("SELECT intent, error_count FROM intent_errors WHERE error_count > 0")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows.flatten() {
            error_intents.insert(row.0, row.1 as u32);
        }
        drop(stmt);

        Ok(Self { conn, thresholds, error_intents })
    }

    /// Aggregates signals and decides one of answer/hedge/clarify/uncertain.
    pub fn assess_confidence(
        &mut self,
        user_input: &str,
        route: Option<RouteSignal>,
        known_words_fraction: f32,
        alternative_confidences: &[f32],
    ) -> Result<Assessment> {
        let route_confidence = route.as_ref().map(|r| r.confidence).unwrap_or(0.0);
        let route_source_weight = match route.as_ref().map(|r| r.source) {
            Some("learned_pattern") => 0.9,
            Some("rule") => 0.85,
            Some(_) => 0.5,
            None => 0.0,
        };

        let word_count = user_input.split_whitespace().count();
        let length_signal = match word_count {
            0..=1 => 0.3,
            2..=5 => 0.9,
            6..=15 => 0.7,
            _ => 0.5,
        };

        let ambiguity = if alternative_confidences.len() >= 2 {
            let mut sorted = alternative_confidences.to_vec();
            sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
            let gap = sorted[0] - sorted[1];
            (gap * 2.0).min(1.0)
        } else {
            0.8
        };

        let intent = route.as_ref().map(|r| r.intent).unwrap_or("none");
        let error_count = self.error_intents.get(intent).copied().unwrap_or(0);
        let historical = if error_count > 3 {
            0.3
        } else if error_count > 0 {
            0.6
        } else {
            0.9
        };

        let lower = user_input.to_lowercase();
        let is_question_word = QUESTION_WORDS.iter().any(|w| lower.split_whitespace().any(|t| t == *w));
        let is_question = if is_question_word || lower.trim_end().ends_with('?') { 0.8 } else { 0.6 };

        let signals: &[(f32, f32)] = &[
            (route_confidence, 3.0),
            (route_source_weight, 1.5),
            (known_words_fraction, 1.0),
            (length_signal, 0.5),
            (ambiguity, 2.0),
            (historical, 1.5),
            (is_question, 0.3),
        ];
        let total_weight: f32 = signals.iter().map(|(_, w)| w).sum();
        let weighted_sum: f32 = signals.iter().map(|(v, w)| v * w).sum();
        let confidence = (weighted_sum / total_weight).clamp(0.0, 1.0);

        let (action, phrase) = self.decide_action(confidence, route.as_ref());

        let now = chrono_now();
        self.conn.execute(
            "INSERT INTO confidence_log (user_input, intent, confidence, action, route_source, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_input, intent, confidence as f64, action_str(action), route.as_ref().map(|r| r.source).unwrap_or("none"), now],
        )?;
        let request_id = self.conn.last_insert_rowid();

        tracing::debug!(confidence, ?action, intent, "assessed confidence");
        Ok(Assessment { confidence, action, request_id, phrase })
    }

    fn decide_action(&self, confidence: f32, route: Option<&RouteSignal>) -> (Action, Option<String>) {
        let mut rng = rand::rng();
        if confidence >= self.thresholds.sure {
            return (Action::Answer, None);
        }
        if confidence >= self.thresholds.hedged {
            let idx = rng.random_range(0..HEDGING_PHRASES.len());
            return (Action::Hedge, Some(HEDGING_PHRASES[idx].to_string()));
        }
        if confidence >= self.thresholds.ask {
            let clarification = match route.map(|r| r.intent) {
                Some(intent) if !intent.is_empty() => {
                    let desc = INTENT_DESCRIPTIONS.get(intent).copied().unwrap_or(intent);
                    format!("It sounds like you want to {desc}. Is that right?")
                }
                _ => UNCERTAINTY_PHRASES[rng.random_range(0..UNCERTAINTY_PHRASES.len())].to_string(),
            };
            return (Action::Clarify, Some(clarification));
        }
        let idx = rng.random_range(0..UNCERTAINTY_PHRASES.len());
        (Action::Uncertain, Some(UNCERTAINTY_PHRASES[idx].to_string()))
    }

    /// Reports whether a past assessment's implied answer was correct,
    /// updating per-intent error counts and nudging the thresholds.
    pub fn feedback(&mut self, request_id: i64, correct: bool) -> Result<()> {
        let row: Option<(String, f64, String)> = self
            .conn
            .query_row("SELECT intent, confidence, action FROM confidence_log WHERE id = ?1", params![request_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .optional()?;
        let Some((intent, confidence, action)) = row else { return Ok(()) };
        let confidence = confidence as f32;

        self.conn.execute("UPDATE confidence_log SET was_correct = ?1 WHERE id = ?2", params![correct as i64, request_id])?;

        if correct {
            self.conn.execute(
                "INSERT INTO intent_errors (intent, success_count) VALUES (?1, 1)
                 ON CONFLICT(intent) DO UPDATE SET success_count = success_count + 1",
                params![intent],
            )?;
        } else {
            *self.error_intents.entry(intent.clone()).or_insert(0) += 1;
            self.conn.execute(
                "INSERT INTO intent_errors (intent, error_count) VALUES (?1, 1)
                 ON CONFLICT(intent) DO UPDATE SET error_count = error_count + 1",
                params![intent],
            )?;
        }

        self.adapt_thresholds(confidence, &action, correct)?;
        Ok(())
    }

    fn adapt_thresholds(&mut self, confidence: f32, action: &str, correct: bool) -> Result<()> {
        let _ = confidence;
        match (action, correct) {
            ("answer", false) => self.thresholds.sure = (self.thresholds.sure + ADJUSTMENT).min(0.95),
            ("hedge", false) => self.thresholds.hedged = (self.thresholds.hedged + ADJUSTMENT).min(self.thresholds.sure - 0.05),
            ("clarify", true) | ("uncertain", true) => {
                self.thresholds.ask = (self.thresholds.ask - ADJUSTMENT).max(0.1);
                self.thresholds.hedged = (self.thresholds.hedged - ADJUSTMENT).max(self.thresholds.ask + 0.05);
            }
            ("answer", true) => self.thresholds.sure = (self.thresholds.sure - ADJUSTMENT * 0.5).max(0.6),
            _ => {}
        }

        for (key, value) in [("sure", self.thresholds.sure), ("hedged", self.thresholds.hedged), ("ask", self.thresholds.ask)] {
            self.conn.execute(
                "INSERT INTO thresholds (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value as f64],
            )?;
        }
        Ok(())
    }

    pub fn get_improvement_suggestions(&self) -> Result<Vec<String>> {
        let mut suggestions = Vec::new();
        let mut ranked: Vec<(&String, &u32)> = self.error_intents.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));
        for (intent, count) in ranked.into_iter().take(3) {
            if *count >= 3 {
                suggestions.push(format!("Intent '{intent}' has {count} errors — needs more training examples or tighter rules"));
            }
        }

        let total: i64 = self.conn.query_row("SELECT COUNT(*) FROM confidence_log", [], |r| r.get(0))?;
        if total > 10 {
            let uncertain: i64 = self.conn.query_row("SELECT COUNT(*) FROM confidence_log WHERE action = 'uncertain'", [], |r| r.get(0))?;
            if uncertain as f32 > total as f32 * 0.3 {
                suggestions.push("Too many uncertain answers (>30%) — the pattern base needs to grow".to_string());
            }
        }
        Ok(suggestions)
    }

    pub fn stats(&self) -> Result<ActiveLearningStats> {
        let total: i64 = self.conn.query_row("SELECT COUNT(*) FROM confidence_log", [], |r| r.get(0))?;
        let correct: i64 = self.conn.query_row("SELECT COUNT(*) FROM confidence_log WHERE was_correct = 1", [], |r| r.get(0))?;
        let incorrect: i64 = self.conn.query_row("SELECT COUNT(*) FROM confidence_log WHERE was_correct = 0", [], |r| r.get(0))?;
        let evaluated = correct + incorrect;
        let accuracy_pct = if evaluated > 0 { correct as f32 / evaluated as f32 * 100.0 } else { 0.0 };
        Ok(ActiveLearningStats {
            total_assessments: total as u64,
            evaluated: evaluated as u64,
            accuracy_pct,
            sure: self.thresholds.sure,
            hedged: self.thresholds.hedged,
            ask: self.thresholds.ask,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ActiveLearningStats {
    pub total_assessments: u64,
    pub evaluated: u64,
    pub accuracy_pct: f32,
    pub sure: f32,
    pub hedged: f32,
    pub ask: f32,
}

fn action_str(action: Action) -> &'static str {
    match action {
        Action::Answer => "answer",
        Action::Hedge => "hedge",
        Action::Clarify => "clarify",
        Action::Uncertain => "uncertain",
    }
}

fn chrono_now() -> String {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> (ActiveLearning, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ActiveLearning::open(&dir.path().join("al.db")).unwrap(), dir)
    }

    #[test]
    fn high_route_confidence_yields_answer() {
        let (mut al, _dir) = planner();
        let route = RouteSignal { confidence: 0.95, source: "learned_pattern", intent: "greeting" };
        let assessment = al.assess_confidence("hello there", Some(route), 1.0, &[]).unwrap();
        assert_eq!(assessment.action, Action::Answer);
    }

    #[test]
    fn no_route_yields_low_confidence_action() {
        let (mut al, _dir) = planner();
        let assessment = al.assess_confidence("x", None, 0.1, &[]).unwrap();
        assert!(matches!(assessment.action, Action::Clarify | Action::Uncertain));
    }

    #[test]
    fn incorrect_answer_raises_sure_threshold() {
        let (mut al, _dir) = planner();
        let before = al.stats().unwrap().sure;
        let route = RouteSignal { confidence: 0.95, source: "learned_pattern", intent: "greeting" };
        let assessment = al.assess_confidence("hello", Some(route), 1.0, &[]).unwrap();
        al.feedback(assessment.request_id, false).unwrap();
        assert!(al.stats().unwrap().sure > before);
    }

    #[test]
    fn repeated_intent_errors_lower_historical_signal() {
        let (mut al, _dir) = planner();
        for _ in 0..4 {
            let route = RouteSignal { confidence: 0.95, source: "rule", intent: "flaky_intent" };
            let a = al.assess_confidence("do the flaky thing", Some(route), 1.0, &[]).unwrap();
            al.feedback(a.request_id, false).unwrap();
        }
        let route = RouteSignal { confidence: 0.95, source: "rule", intent: "flaky_intent" };
        let after = al.assess_confidence("do the flaky thing", Some(route), 1.0, &[]).unwrap();
        assert!(after.confidence < 0.95);
    }
}
