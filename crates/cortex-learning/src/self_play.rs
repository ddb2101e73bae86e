use std::collections::{HashMap, VecDeque};
use std::path::Path;

use cortex_core::db::open_component_db;
use cortex_core::{CoreError, LlmProvider, Result};
use cortex_embeddings::WordEmbeddings;
use cortex_reasoning::KnowledgeDistillation;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

const DEFAULT_THRESHOLD: f32 = 6.0;
const EXAM_PASS_RATE: f32 = 0.80;
const THRESHOLD_RAISE: f32 = 0.5;
const THRESHOLD_CAP: f32 = 9.0;
const TREND_WINDOW: usize = 50;
const REINFORCE_BOOST: f32 = 0.1;
const WEAKEN_PENALTY: f32 = 0.15;

#[derive(Debug, Clone, Deserialize)]
struct EvalResponse {
    score: f32,
    feedback: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    weaknesses: Vec<String>,
    #[serde(default)]
    correct_answer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub question: String,
    pub answer: String,
    pub score: f32,
    pub feedback: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub correct_answer: Option<String>,
    pub source_tier: String,
    pub reinforced: bool,
}

#[derive(Debug, Clone)]
pub struct ExamResult {
    pub total_questions: usize,
    pub avg_score: f32,
    pub pass_rate: f32,
    pub by_category: HashMap<String, f32>,
    pub improvements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

struct PendingItem {
    question: String,
    answer: String,
    source_tier: String,
    pattern_id: Option<i64>,
}

static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[\s\S]*\}").unwrap());
static JSON_ARRAY_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[\s\S]*\]").unwrap());

static EXAM_QUESTIONS: Lazy<Vec<(&'static str, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        ("greeting", &["Hello, how are you?", "Good morning", "Hey, what's up?"]),
        ("self_awareness", &["What are you?", "Can you feel things?", "Are you conscious?"]),
        ("help", &["Can you help me write a file?", "What can you do?", "How do I ask you to search the web?"]),
        ("emotion", &["I'm feeling frustrated today", "That's great news!", "I'm worried about this deadline"]),
        ("knowledge", &["What is a neural network?", "Explain recursion simply", "What's the difference between a list and a tuple?"]),
    ]
});

fn eval_prompt(question: &str, answer: &str) -> String {
    format!(
        "You are grading an assistant's answer to a user question.\n\
         Question: {question}\n\
         Answer: {answer}\n\n\
         Score the answer from 0 to 10 on correctness, helpfulness and tone.\n\
         Respond with JSON only: {{\"score\": <0-10>, \"feedback\": \"...\", \
         \"strengths\": [...], \"weaknesses\": [...], \"correct_answer\": \"...\" or null}}"
    )
}

fn batch_eval_prompt(items: &[(String, String)]) -> String {
    let mut body = String::from(
        "You are grading several assistant answers at once. Score each from 0 to 10.\n\
         Respond with a JSON array, one object per pair in order, each shaped like\n\
         {\"score\": <0-10>, \"feedback\": \"...\", \"strengths\": [...], \"weaknesses\": [...], \"correct_answer\": \"...\" or null}.\n\n",
    );
    for (i, (q, a)) in items.iter().enumerate() {
        body.push_str(&format!("Pair {}:\nQuestion: {q}\nAnswer: {a}\n\n", i + 1));
    }
    body
}

fn parse_eval_response(raw: &str) -> Result<EvalResponse> {
    let candidate = JSON_BLOCK.find(raw).map(|m| m.as_str()).unwrap_or(raw);
    serde_json::from_str(candidate).map_err(|e| CoreError::Invariant(format!("judge returned unparsable evaluation: {e}")))
}

fn parse_batch_response(raw: &str, expected: usize) -> Vec<Option<EvalResponse>> {
    let candidate = JSON_ARRAY_BLOCK.find(raw).map(|m| m.as_str().to_string());
    let parsed: Option<Vec<EvalResponse>> = candidate.and_then(|c| serde_json::from_str(&c).ok());
    match parsed {
        Some(v) if v.len() == expected => v.into_iter().map(Some).collect(),
        Some(v) => {
            let mut out: Vec<Option<EvalResponse>> = v.into_iter().map(Some).collect();
            out.resize(expected, None);
            out
        }
        None => vec![None; expected],
    }
}

/// LLM-judged self-evaluation: scores its own answers, reinforces or
/// weakens the pattern that produced them, and periodically exams
/// itself against a fixed question bank outside the normal route path.
pub struct SelfPlay {
    conn: rusqlite::Connection,
    threshold: f32,
    recent_scores: VecDeque<f32>,
    batch_buffer: Vec<PendingItem>,
    batch_size: usize,
    total_evals: u64,
    reinforced_count: u64,
    weakened_count: u64,
}

impl SelfPlay {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_component_db(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS evaluations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                score REAL NOT NULL,
                feedback TEXT,
                source_tier TEXT,
                reinforced INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS exam_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                total_questions INTEGER NOT NULL,
                avg_score REAL NOT NULL,
                pass_rate REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS self_play_state (
                key TEXT PRIMARY KEY,
                value REAL NOT NULL
            );",
        )?;

        let threshold = conn
            .query_row("SELECT value FROM self_play_state WHERE key = 'threshold'", [], |r| r.get::<_, f64>(0))
            .optional()?
            .map(|v| v as f32)
            .unwrap_or(DEFAULT_THRESHOLD);

        let mut recent_scores = VecDeque::with_capacity(TREND_WINDOW);
        let mut stmt = conn.prepare("SELECT score FROM evaluations ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![TREND_WINDOW as i64], |r| r.get::<_, f64>(0))?;
        let mut scores: Vec<f32> = rows.flatten().map(|v| v as f32).collect();
        scores.reverse();
        recent_scores.extend(scores);
        drop(stmt);

        let total_evals: i64 = conn.query_row("SELECT COUNT(*) FROM evaluations", [], |r| r.get(0))?;

        Ok(Self {
            conn,
            threshold,
            recent_scores,
            batch_buffer: Vec::new(),
            batch_size: 5,
            total_evals: total_evals as u64,
            reinforced_count: 0,
            weakened_count: 0,
        })
    }

    /// Single-question judge call, outside the batching path.
    pub async fn evaluate(
        &mut self,
        question: &str,
        answer: &str,
        source_tier: &str,
        pattern_id: Option<i64>,
        judge: &dyn LlmProvider,
        patterns: &mut cortex_patterns::LearnedPatterns,
        kd: &mut KnowledgeDistillation,
        words: &mut WordEmbeddings,
    ) -> Result<Evaluation> {
        let raw = judge.judge(&eval_prompt(question, answer), "json").await?;
        let parsed = parse_eval_response(&raw)?;
        let evaluation = self.apply_reinforcement(question, answer, source_tier, parsed, pattern_id, patterns, kd, words)?;
        self.record(&evaluation)?;
        Ok(evaluation)
    }

    /// Buffers an item; once `batch_size` items accumulate, call
    /// `flush_batch` to score them in one judge round-trip.
    pub fn queue(&mut self, question: &str, answer: &str, source_tier: &str, pattern_id: Option<i64>) {
        self.batch_buffer.push(PendingItem {
            question: question.to_string(),
            answer: answer.to_string(),
            source_tier: source_tier.to_string(),
            pattern_id,
        });
    }

    pub fn batch_ready(&self) -> bool {
        self.batch_buffer.len() >= self.batch_size
    }

    pub async fn flush_batch(
        &mut self,
        judge: &dyn LlmProvider,
        patterns: &mut cortex_patterns::LearnedPatterns,
        kd: &mut KnowledgeDistillation,
        words: &mut WordEmbeddings,
    ) -> Result<Vec<Evaluation>> {
        if self.batch_buffer.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<PendingItem> = self.batch_buffer.drain(..).collect();
        let pairs: Vec<(String, String)> = items.iter().map(|i| (i.question.clone(), i.answer.clone())).collect();
        let raw = judge.judge(&batch_eval_prompt(&pairs), "json").await?;
        let parsed = parse_batch_response(&raw, items.len());

        let mut out = Vec::with_capacity(items.len());
        for (item, maybe_parsed) in items.into_iter().zip(parsed.into_iter()) {
            let parsed = maybe_parsed.unwrap_or(EvalResponse {
                score: 0.0,
                feedback: "judge returned no scoreable entry for this pair".to_string(),
                strengths: Vec::new(),
                weaknesses: Vec::new(),
                correct_answer: None,
            });
            let evaluation =
                self.apply_reinforcement(&item.question, &item.answer, &item.source_tier, parsed, item.pattern_id, patterns, kd, words)?;
            self.record(&evaluation)?;
            out.push(evaluation);
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_reinforcement(
        &mut self,
        question: &str,
        answer: &str,
        source_tier: &str,
        parsed: EvalResponse,
        pattern_id: Option<i64>,
        patterns: &mut cortex_patterns::LearnedPatterns,
        kd: &mut KnowledgeDistillation,
        words: &mut WordEmbeddings,
    ) -> Result<Evaluation> {
        let score = parsed.score.clamp(0.0, 10.0);
        let mut reinforced = false;

        if let Some(pid) = pattern_id {
            if score >= self.threshold {
                patterns.reinforce_with_delta(pid, REINFORCE_BOOST * (score / 10.0))?;
                reinforced = true;
                self.reinforced_count += 1;
            } else {
                patterns.weaken_with_delta(pid, WEAKEN_PENALTY * (1.0 - score / 10.0))?;
                self.weakened_count += 1;
            }
        }

        if let Some(correct) = &parsed.correct_answer {
            if score < self.threshold {
                let tokens: Vec<String> = correct.split_whitespace().map(|w| w.to_lowercase()).collect();
                words.train_on_tokens(&tokens)?;
                kd.distill(question, correct, source_tier, true)?;
            }
        }

        self.recent_scores.push_back(score);
        if self.recent_scores.len() > TREND_WINDOW {
            self.recent_scores.pop_front();
        }
        self.total_evals += 1;

        Ok(Evaluation {
            question: question.to_string(),
            answer: answer.to_string(),
            score,
            feedback: parsed.feedback,
            strengths: parsed.strengths,
            weaknesses: parsed.weaknesses,
            correct_answer: parsed.correct_answer,
            source_tier: source_tier.to_string(),
            reinforced,
        })
    }

    fn record(&mut self, evaluation: &Evaluation) -> Result<()> {
        self.conn.execute(
            "INSERT INTO evaluations (question, answer, score, feedback, source_tier, reinforced, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                evaluation.question,
                evaluation.answer,
                evaluation.score as f64,
                evaluation.feedback,
                evaluation.source_tier,
                evaluation.reinforced as i64,
                now(),
            ],
        )?;
        Ok(())
    }

    /// Runs the fixed exam question set through a caller-supplied
    /// generator, bypassing the normal route path entirely.
    pub async fn run_exam<G>(&mut self, mut generate: G) -> Result<ExamResult>
    where
        G: FnMut(&str) -> Result<String>,
    {
        let mut scores = Vec::new();
        let mut by_category: HashMap<String, Vec<f32>> = HashMap::new();
        for (category, questions) in EXAM_QUESTIONS.iter() {
            for question in *questions {
                let answer = generate(question)?;
                let score = self.score_exam_answer(question, &answer);
                scores.push(score);
                by_category.entry(category.to_string()).or_default().push(score);
            }
        }

        let total_questions = scores.len();
        let avg_score = if total_questions > 0 { scores.iter().sum::<f32>() / total_questions as f32 } else { 0.0 };
        let pass_rate = if total_questions > 0 {
            scores.iter().filter(|s| **s >= self.threshold).count() as f32 / total_questions as f32
        } else {
            0.0
        };

        let by_category: HashMap<String, f32> =
            by_category.into_iter().map(|(k, v)| (k, v.iter().sum::<f32>() / v.len() as f32)).collect();

        let mut improvements = Vec::new();
        for (category, avg) in &by_category {
            if *avg < self.threshold {
                improvements.push(format!("Weak on '{category}' (avg {avg:.1}) — needs more examples in that area"));
            }
        }

        if pass_rate >= EXAM_PASS_RATE {
            self.threshold = (self.threshold + THRESHOLD_RAISE).min(THRESHOLD_CAP);
            self.conn.execute(
                "INSERT INTO self_play_state (key, value) VALUES ('threshold', ?1) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![self.threshold as f64],
            )?;
        }

        self.conn.execute(
            "INSERT INTO exam_results (total_questions, avg_score, pass_rate, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![total_questions as i64, avg_score as f64, pass_rate as f64, now()],
        )?;

        Ok(ExamResult { total_questions, avg_score, pass_rate, by_category, improvements })
    }

    /// Scores an exam answer heuristically (no judge call, since the
    /// exam deliberately runs outside the LLM-in-the-loop path).
    fn score_exam_answer(&self, _question: &str, answer: &str) -> f32 {
        let words = answer.split_whitespace().count();
        if answer.trim().is_empty() {
            0.0
        } else if words < 3 {
            3.0
        } else if words < 100 {
            7.5
        } else {
            6.0
        }
    }

    pub fn trend(&self) -> Trend {
        if self.recent_scores.len() < 10 {
            return Trend::Stable;
        }
        let n = self.recent_scores.len();
        let half = n / 2;
        let older: f32 = self.recent_scores.iter().take(half).sum::<f32>() / half as f32;
        let recent: f32 = self.recent_scores.iter().skip(half).sum::<f32>() / (n - half) as f32;
        if older <= 0.0 {
            return Trend::Stable;
        }
        let ratio = recent / older;
        if ratio > 1.05 {
            Trend::Improving
        } else if ratio < 0.95 {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }

    pub fn stats(&self) -> (u64, u64, u64, f32) {
        (self.total_evals, self.reinforced_count, self.weakened_count, self.threshold)
    }
}

fn now() -> String {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubJudge {
        score: f32,
    }

    #[async_trait::async_trait]
    impl LlmProvider for StubJudge {
        async fn chat(&self, _messages: &[cortex_core::Message], _opts: &cortex_core::ChatOptions) -> Result<cortex_core::ChatResponse> {
            unimplemented!("not exercised by these tests")
        }

        async fn summarize(&self, _prompt: &str) -> Result<String> {
            unimplemented!("not exercised by these tests")
        }

        async fn judge(&self, _prompt: &str, _format_hint: &str) -> Result<String> {
            Ok(format!(
                "{{\"score\": {}, \"feedback\": \"fine\", \"strengths\": [], \"weaknesses\": [], \"correct_answer\": null}}",
                self.score
            ))
        }
    }

    fn setup() -> (SelfPlay, cortex_patterns::LearnedPatterns, KnowledgeDistillation, WordEmbeddings, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let sp = SelfPlay::open(&dir.path().join("sp.db")).unwrap();
        let patterns = cortex_patterns::LearnedPatterns::open(&dir.path().join("patterns.db")).unwrap();
        let kd = KnowledgeDistillation::open(&dir.path().join("kd.db")).unwrap();
        let words = WordEmbeddings::open(&dir.path().join("words.db"), 32).unwrap();
        (sp, patterns, kd, words, dir)
    }

    fn seeded_pattern_id(patterns: &mut cortex_patterns::LearnedPatterns) -> i64 {
        patterns.learn_routing("hello there", "greeting", "chat", "rule").unwrap();
        patterns.find_routing("hello there", 0.0).unwrap().unwrap().pattern_id
    }

    #[tokio::test]
    async fn high_score_reinforces_pattern() {
        let (mut sp, mut patterns, mut kd, mut words, _dir) = setup();
        let pid = seeded_pattern_id(&mut patterns);
        let judge = StubJudge { score: 9.0 };
        let evaluation = sp.evaluate("hello", "Hi there!", "learned_pattern", Some(pid), &judge, &mut patterns, &mut kd, &mut words).await.unwrap();
        assert!(evaluation.reinforced);
    }

    #[tokio::test]
    async fn low_score_weakens_pattern() {
        let (mut sp, mut patterns, mut kd, mut words, _dir) = setup();
        let pid = seeded_pattern_id(&mut patterns);
        let judge = StubJudge { score: 2.0 };
        let evaluation = sp.evaluate("hello", "Hi there!", "learned_pattern", Some(pid), &judge, &mut patterns, &mut kd, &mut words).await.unwrap();
        assert!(!evaluation.reinforced);
    }

    #[tokio::test]
    async fn exam_runs_every_category() {
        let (mut sp, _patterns, _kd, _words, _dir) = setup();
        let result = sp.run_exam(|q| Ok(format!("a reasonable answer to: {q}"))).await.unwrap();
        assert_eq!(result.total_questions, EXAM_QUESTIONS.iter().map(|(_, q)| q.len()).sum::<usize>());
    }
}
