//! The self-improving layer that lets the router answer without the
//! LLM on the second occurrence of a request it previously needed the
//! LLM to resolve: SQLite + FTS5 over `keywords`, with three pattern
//! families (routing, response, slot) each reinforced on repeated
//! success and weakened on failure.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use cortex_core::db::open_component_db;
use cortex_core::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};

pub const REINFORCE_DELTA: f32 = 0.05;
pub const WEAKEN_DELTA: f32 = 0.15;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "is", "are", "a", "an", "in", "on", "for", "to", "of", "and", "or", "but",
        "with", "this", "that", "you", "your", "me", "my", "it", "its", "i", "he", "she",
        "we", "they", "please", "can", "could", "would", "thanks", "hello", "hi",
    ]
    .into_iter()
    .collect()
});

fn extract_keywords(text: &str) -> String {
    static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-zа-яё0-9]+").unwrap());
    let lowered = text.to_lowercase();
    WORD_RE
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        .take(15)
        .collect::<Vec<_>>()
        .join(" ")
}

fn fts_escape(keywords: &str) -> String {
    keywords
        .split_whitespace()
        .map(|w| format!("\"{}\"", w.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[derive(Debug, Clone)]
pub struct RoutingMatch {
    pub pattern_id: i64,
    pub intent: String,
    pub agent: String,
    pub confidence: f32,
    pub source: &'static str,
}

pub struct LearnedPatterns {
    conn: Connection,
}

impl LearnedPatterns {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_component_db(path)?;
        Self::create_schema(&conn)?;
        Ok(Self { conn })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS routing_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pattern TEXT NOT NULL,
                keywords TEXT NOT NULL,
                intent TEXT NOT NULL,
                agent TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 1.0,
                successes INTEGER NOT NULL DEFAULT 1,
                failures INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL,
                source TEXT NOT NULL DEFAULT 'llm'
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS routing_fts
                USING fts5(keywords, content=routing_patterns, content_rowid=id);
            CREATE TABLE IF NOT EXISTS response_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent TEXT NOT NULL,
                result_type TEXT NOT NULL,
                template TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 1.0,
                successes INTEGER NOT NULL DEFAULT 1,
                failures INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_used INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS slot_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent TEXT NOT NULL,
                slot_name TEXT NOT NULL,
                regex_pattern TEXT NOT NULL,
                examples TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL DEFAULT 1.0,
                successes INTEGER NOT NULL DEFAULT 1,
                failures INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_routing_intent ON routing_patterns(intent);
            CREATE INDEX IF NOT EXISTS idx_routing_confidence ON routing_patterns(confidence DESC);
            CREATE INDEX IF NOT EXISTS idx_slots_intent ON slot_patterns(intent);",
        )?;
        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// `learn_routing`: reinforce an existing matching pattern, or
    /// insert a fresh one at `confidence = 1.0`.
    pub fn learn_routing(&mut self, utterance: &str, intent: &str, agent: &str, source: &str) -> Result<()> {
        let keywords = extract_keywords(utterance);
        if keywords.is_empty() {
            return Ok(());
        }

        if let Some(id) = self.find_similar_routing(&keywords, intent)? {
            self.reinforce_routing(id, REINFORCE_DELTA * 0.6)?;
            return Ok(());
        }

        let now = Self::now();
        self.conn.execute(
            "INSERT INTO routing_patterns (pattern, keywords, intent, agent, confidence, created_at, last_used, source)
             VALUES (?1, ?2, ?3, ?4, 1.0, ?5, ?5, ?6)",
            params![utterance, keywords, intent, agent, now, source],
        )?;
        let rowid = self.conn.last_insert_rowid();
        self.conn.execute(
            "INSERT INTO routing_fts(rowid, keywords) VALUES (?1, ?2)",
            params![rowid, keywords],
        )?;
        Ok(())
    }

    fn find_similar_routing(&self, keywords: &str, intent: &str) -> Result<Option<i64>> {
        let escaped = fts_escape(keywords);
        if escaped.is_empty() {
            return Ok(None);
        }
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT rp.id FROM routing_fts
                 JOIN routing_patterns rp ON routing_fts.rowid = rp.id
                 WHERE routing_fts MATCH ?1 AND rp.intent = ?2
                 LIMIT 1",
                params![escaped, intent],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// `find_routing`: FTS lookup ranked by
    /// `confidence * successes/(failures+1) * fts_rank`.
    pub fn find_routing(&mut self, utterance: &str, min_confidence: f32) -> Result<Option<RoutingMatch>> {
        let keywords = extract_keywords(utterance);
        if keywords.is_empty() {
            return Ok(None);
        }
        let escaped = fts_escape(&keywords);
        if escaped.is_empty() {
            return Ok(None);
        }

        let mut stmt = self.conn.prepare(
            "SELECT rp.id, rp.intent, rp.agent, rp.confidence, rp.successes, rp.failures, routing_fts.rank
             FROM routing_fts
             JOIN routing_patterns rp ON routing_fts.rowid = rp.id
             WHERE routing_fts MATCH ?1 AND rp.confidence >= ?2
             ORDER BY routing_fts.rank
             LIMIT 5",
        )?;
        let rows = stmt.query_map(params![escaped, min_confidence], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)? as f32,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, f64>(6)?,
            ))
        })?;

        let mut best: Option<(i64, String, String, f32)> = None;
        let mut best_score = 0.0f64;
        for row in rows {
            let (id, intent, agent, confidence, successes, failures, fts_rank) = row?;
            // sqlite's bm25 rank is negative and smaller-is-better; invert to a positive weight.
            let rank_weight = 1.0 / (1.0 + fts_rank.abs());
            let score = confidence as f64 * (successes as f64 / (failures as f64 + 1.0)) * rank_weight;
            if score > best_score {
                best_score = score;
                best = Some((id, intent, agent, confidence));
            }
        }

        let Some((id, intent, agent, confidence)) = best else { return Ok(None) };
        self.conn.execute(
            "UPDATE routing_patterns SET last_used = ?1 WHERE id = ?2",
            params![Self::now(), id],
        )?;
        Ok(Some(RoutingMatch { pattern_id: id, intent, agent, confidence, source: "learned" }))
    }

    /// Generates a slot regex anchored on the token preceding `value`
    /// in `utterance`, with a body shape chosen by value type.
    fn generate_slot_regex(utterance: &str, value: &str) -> Option<String> {
        let lower = utterance.to_lowercase();
        let needle = value.to_lowercase();
        let start = lower.find(&needle)?;
        let prefix = lower[..start].trim();
        let anchor = prefix.split_whitespace().last()?;
        let anchor_escaped = regex::escape(anchor);

        static FILENAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w.\-]+\.\w+$").unwrap());
        if FILENAME_RE.is_match(value) {
            Some(format!(r"{anchor_escaped}\s+([\w.\-]+\.\w+)"))
        } else if value.starts_with('/') || value.starts_with('~') {
            Some(format!(r"{anchor_escaped}\s+([/~][\w/.\-]+)"))
        } else {
            Some(format!(r"{anchor_escaped}\s+(.+?)(?:\s*$)"))
        }
    }

    pub fn learn_slots(&mut self, intent: &str, utterance: &str, extracted: &HashMap<String, String>) -> Result<()> {
        for (slot_name, value) in extracted {
            if value.is_empty() {
                continue;
            }
            let Some(regex) = Self::generate_slot_regex(utterance, value) else { continue };
            // Invariant: the regex must capture at least one group.
            if Regex::new(&regex).map(|r| r.captures_len() < 2).unwrap_or(true) {
                continue;
            }

            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM slot_patterns WHERE intent = ?1 AND slot_name = ?2 AND regex_pattern = ?3",
                    params![intent, slot_name, regex],
                    |r| r.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                self.conn.execute("UPDATE slot_patterns SET successes = successes + 1 WHERE id = ?1", params![id])?;
            } else {
                let examples = serde_json::json!([{ "input": utterance, "value": value }]).to_string();
                self.conn.execute(
                    "INSERT INTO slot_patterns (intent, slot_name, regex_pattern, examples, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![intent, slot_name, regex, examples, Self::now()],
                )?;
            }
        }
        Ok(())
    }

    /// `find_slots`: extracts arguments by previously-learned regex,
    /// highest-`successes` first. Never raises on a bad regex.
    pub fn find_slots(&self, intent: &str, utterance: &str) -> Result<HashMap<String, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT slot_name, regex_pattern FROM slot_patterns
             WHERE intent = ?1 AND confidence >= 0.5
             ORDER BY successes DESC",
        )?;
        let rows = stmt.query_map(params![intent], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;

        let mut slots = HashMap::new();
        for row in rows {
            let (slot_name, pattern) = row?;
            let Ok(re) = Regex::new(&pattern) else { continue };
            if let Some(caps) = re.captures(utterance) {
                let value = caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str().to_string());
                if let Some(v) = value {
                    slots.entry(slot_name).or_insert(v);
                }
            }
        }
        Ok(slots)
    }

    fn reinforce_routing(&mut self, id: i64, delta: f32) -> Result<()> {
        self.conn.execute(
            "UPDATE routing_patterns
             SET successes = successes + 1,
                 confidence = MIN(1.0, confidence + ?1),
                 last_used = ?2
             WHERE id = ?3",
            params![delta as f64, Self::now(), id],
        )?;
        Ok(())
    }

    pub fn reinforce(&mut self, pattern_id: i64) -> Result<()> {
        self.reinforce_routing(pattern_id, REINFORCE_DELTA)
    }

    pub fn weaken(&mut self, pattern_id: i64) -> Result<()> {
        self.weaken_routing(pattern_id, WEAKEN_DELTA)
    }

    /// Reinforce by a caller-supplied delta instead of the flat
    /// [`REINFORCE_DELTA`] — used by self-play, which scales the boost
    /// by the judge's score rather than applying a fixed amount.
    pub fn reinforce_with_delta(&mut self, pattern_id: i64, delta: f32) -> Result<()> {
        self.reinforce_routing(pattern_id, delta)
    }

    /// Weaken by a caller-supplied delta instead of the flat
    /// [`WEAKEN_DELTA`] — used by self-play, which scales the penalty
    /// by the judge's score rather than applying a fixed amount.
    pub fn weaken_with_delta(&mut self, pattern_id: i64, delta: f32) -> Result<()> {
        self.weaken_routing(pattern_id, delta)
    }

    fn weaken_routing(&mut self, id: i64, delta: f32) -> Result<()> {
        self.conn.execute(
            "UPDATE routing_patterns
             SET failures = failures + 1,
                 confidence = MAX(0.0, confidence - ?1)
             WHERE id = ?2",
            params![delta as f64, id],
        )?;
        Ok(())
    }

    fn classify_result(result: &str) -> &'static str {
        if result.trim().is_empty() {
            "empty"
        } else if result.starts_with("ERROR") || result.to_lowercase().contains("error") {
            "error"
        } else {
            "success"
        }
    }

    /// `learn_response`: replaces the literal tool result inside
    /// `final_text` with `{result}` so the template is reusable.
    pub fn learn_response(&mut self, intent: &str, tool_result: &str, final_text: &str) -> Result<()> {
        let result_type = Self::classify_result(tool_result);
        let template = if !tool_result.is_empty() && final_text.contains(tool_result) {
            final_text.replace(tool_result, "{result}")
        } else {
            final_text.to_string()
        };

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM response_patterns WHERE intent = ?1 AND result_type = ?2 LIMIT 1",
                params![intent, result_type],
                |r| r.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            self.conn.execute(
                "UPDATE response_patterns SET successes = successes + 1, confidence = MIN(1.0, confidence + 0.03), last_used = ?1 WHERE id = ?2",
                params![Self::now(), id],
            )?;
        } else {
            let now = Self::now();
            self.conn.execute(
                "INSERT INTO response_patterns (intent, result_type, template, created_at, last_used) VALUES (?1, ?2, ?3, ?4, ?4)",
                params![intent, result_type, template, now],
            )?;
        }
        Ok(())
    }

    pub fn find_response(&mut self, intent: &str, tool_result: &str) -> Result<Option<String>> {
        let result_type = Self::classify_result(tool_result);
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, template FROM response_patterns
                 WHERE intent = ?1 AND result_type = ?2 AND confidence >= 0.6
                 ORDER BY successes DESC LIMIT 1",
                params![intent, result_type],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((id, template)) = row else { return Ok(None) };
        self.conn.execute("UPDATE response_patterns SET last_used = ?1 WHERE id = ?2", params![Self::now(), id])?;
        Ok(Some(template.replace("{result}", tool_result)))
    }

    pub fn cleanup(&mut self, min_confidence: f32, max_age_days: i64) -> Result<()> {
        let cutoff = Self::now() - max_age_days * 86_400;
        self.conn.execute(
            "DELETE FROM routing_patterns WHERE confidence < ?1 AND last_used < ?2",
            params![min_confidence as f64, cutoff],
        )?;
        self.conn.execute(
            "DELETE FROM response_patterns WHERE confidence < ?1 AND last_used < ?2",
            params![min_confidence as f64, cutoff],
        )?;
        self.conn
            .execute("DELETE FROM slot_patterns WHERE confidence < ?1", params![min_confidence as f64])?;
        self.conn.execute("INSERT INTO routing_fts(routing_fts) VALUES('rebuild')", [])?;
        Ok(())
    }

    pub fn stats(&self) -> Result<(i64, i64, i64)> {
        let routing: i64 = self.conn.query_row("SELECT COUNT(*) FROM routing_patterns", [], |r| r.get(0))?;
        let response: i64 = self.conn.query_row("SELECT COUNT(*) FROM response_patterns", [], |r| r.get(0))?;
        let slots: i64 = self.conn.query_row("SELECT COUNT(*) FROM slot_patterns", [], |r| r.get(0))?;
        Ok((routing, response, slots))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, LearnedPatterns) {
        let dir = tempdir().unwrap();
        let lp = LearnedPatterns::open(&dir.path().join("learned_patterns.db")).unwrap();
        (dir, lp)
    }

    #[test]
    fn learn_then_find_routing() {
        let (_dir, mut lp) = fresh();
        lp.learn_routing("delete the temp file please", "delete_file", "executor", "llm").unwrap();
        let found = lp.find_routing("please delete the temp file", 0.6).unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().intent, "delete_file");
    }

    #[test]
    fn repeated_learn_routing_reinforces_not_duplicates() {
        let (_dir, mut lp) = fresh();
        for _ in 0..3 {
            lp.learn_routing("create file report", "create_file", "executor", "llm").unwrap();
        }
        let (routing, _, _) = lp.stats().unwrap();
        assert_eq!(routing, 1);
    }

    #[test]
    fn reinforce_increments_confidence_and_successes() {
        let (_dir, mut lp) = fresh();
        lp.learn_routing("create file report", "create_file", "executor", "llm").unwrap();
        let m = lp.find_routing("create file report", 0.0).unwrap().unwrap();
        lp.weaken(m.pattern_id).unwrap();
        lp.reinforce(m.pattern_id).unwrap();
        let m2 = lp.find_routing("create file report", 0.0).unwrap().unwrap();
        assert!(m2.confidence > 0.0);
    }

    #[test]
    fn slot_learn_and_extract_filename() {
        let (_dir, mut lp) = fresh();
        let mut extracted = HashMap::new();
        extracted.insert("filepath".to_string(), "wishes.txt".to_string());
        lp.learn_slots("create_file", "create file wishes.txt with content", &extracted).unwrap();
        let slots = lp.find_slots("create_file", "create file wishes.txt with content").unwrap();
        assert_eq!(slots.get("filepath"), Some(&"wishes.txt".to_string()));
    }

    #[test]
    fn response_template_round_trips_result_placeholder() {
        let (_dir, mut lp) = fresh();
        lp.learn_response("get_weather", "22C", "It is 22C outside right now.").unwrap();
        let rendered = lp.find_response("get_weather", "22C").unwrap();
        assert_eq!(rendered.as_deref(), Some("It is 22C outside right now."));
    }
}
