use std::collections::HashMap;
use std::path::Path;

use cortex_core::db::open_component_db;
use cortex_core::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

const MAX_TEMPLATE_EXAMPLES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningChain {
    pub id: i64,
    pub intent: String,
    pub steps: Vec<String>,
    pub variables: HashMap<String, String>,
    pub confidence: f32,
    pub is_template: bool,
}

/// KnowledgeDistillation: turns successful LLM responses into
/// reusable reasoning chains, concrete first and then templated.
pub struct KnowledgeDistillation {
    conn: Connection,
}

impl KnowledgeDistillation {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_component_db(path)?;
        Self::create_schema(&conn)?;
        Ok(Self { conn })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS concrete_chains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent TEXT NOT NULL,
                utterance TEXT NOT NULL,
                steps TEXT NOT NULL,
                variables TEXT NOT NULL,
                keywords TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 0.8,
                successes INTEGER NOT NULL DEFAULT 1,
                failures INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS chain_fts
                USING fts5(keywords, content=concrete_chains, content_rowid=id);
            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intent_pattern TEXT NOT NULL UNIQUE,
                template_steps TEXT NOT NULL,
                example_inputs TEXT NOT NULL DEFAULT '[]',
                confidence REAL NOT NULL DEFAULT 0.6,
                successes INTEGER NOT NULL DEFAULT 1,
                failures INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    /// Parses steps from a free-form LLM response: numbered list, then
    /// bullets, then sequential markers, finally action-keyword
    /// sentences as a last resort.
    pub fn parse_steps(response: &str) -> Vec<String> {
        static NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s+(.+)$").unwrap());
        static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-*•]\s+(.+)$").unwrap());
        static MARKERS: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i)\b(first|then|next|after that|finally)\b,?\s*").unwrap());
        static ACTION_SENTENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.!?]+[.!?]").unwrap());
        static ACTION_VERBS: &[&str] =
            &["create", "run", "check", "install", "open", "write", "edit", "delete", "configure", "build", "test"];

        let numbered: Vec<String> = NUMBERED.captures_iter(response).map(|c| c[1].trim().to_string()).collect();
        if !numbered.is_empty() {
            return numbered;
        }
        let bulleted: Vec<String> = BULLET.captures_iter(response).map(|c| c[1].trim().to_string()).collect();
        if !bulleted.is_empty() {
            return bulleted;
        }
        if MARKERS.is_match(response) {
            let parts: Vec<String> = MARKERS
                .split(response)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
            if !parts.is_empty() {
                return parts;
            }
        }
        ACTION_SENTENCE
            .find_iter(response)
            .map(|m| m.as_str().trim())
            .filter(|s| {
                let lower = s.to_lowercase();
                ACTION_VERBS.iter().any(|v| lower.contains(v))
            })
            .map(|s| s.to_string())
            .collect()
    }

    /// Extracts filenames, paths, a recognized language, and a topic
    /// keyword (the most frequent non-trivial word) from the response.
    pub fn extract_variables(utterance: &str, response: &str) -> HashMap<String, String> {
        static FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[\w\-]+\.\w{1,5}\b").unwrap());
        static PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:[\w\-]+/)+[\w\-.]+|~[\w/\-.]+").unwrap());
        static LANGUAGES: &[&str] =
            &["python", "rust", "javascript", "typescript", "go", "java", "c++", "bash", "sql"];

        let mut vars = HashMap::new();
        let joined = format!("{utterance} {response}");

        if let Some(m) = PATH.find(&joined) {
            vars.insert("path".to_string(), m.as_str().to_string());
        } else if let Some(m) = FILENAME.find(&joined) {
            vars.insert("file".to_string(), m.as_str().to_string());
        }

        let lower = joined.to_lowercase();
        if let Some(lang) = LANGUAGES.iter().find(|l| lower.contains(**l)) {
            vars.insert("language".to_string(), lang.to_string());
        }

        if let Some(topic) = top_keyword(utterance) {
            vars.insert("topic".to_string(), topic);
        }
        vars
    }

    fn keywords_for(utterance: &str) -> String {
        utterance
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| w.len() > 2)
            .take(15)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Distills `(utterance, llm_response, intent, success)` into a
    /// concrete chain and upserts the generalized template for the
    /// intent.
    pub fn distill(&mut self, utterance: &str, llm_response: &str, intent: &str, success: bool) -> Result<()> {
        if !success {
            return Ok(());
        }
        let steps = Self::parse_steps(llm_response);
        if steps.is_empty() {
            return Ok(());
        }
        let variables = Self::extract_variables(utterance, llm_response);
        let keywords = Self::keywords_for(utterance);

        let steps_json = serde_json::to_string(&steps)?;
        let vars_json = serde_json::to_string(&variables)?;
        self.conn.execute(
            "INSERT INTO concrete_chains (intent, utterance, steps, variables, keywords, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![intent, utterance, steps_json, vars_json, keywords, Self::now()],
        )?;
        let rowid = self.conn.last_insert_rowid();
        self.conn.execute("INSERT INTO chain_fts(rowid, keywords) VALUES (?1, ?2)", params![rowid, keywords])?;

        self.upsert_template(intent, &steps, &variables, utterance)?;
        Ok(())
    }

    fn upsert_template(
        &mut self,
        intent: &str,
        steps: &[String],
        variables: &HashMap<String, String>,
        utterance: &str,
    ) -> Result<()> {
        let mut templated_steps = steps.to_vec();
        for step in templated_steps.iter_mut() {
            for (var, value) in variables {
                if !value.is_empty() {
                    *step = step.replace(value.as_str(), &format!("{{{var}}}"));
                }
            }
        }
        let template_json = serde_json::to_string(&templated_steps)?;

        let existing: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, example_inputs FROM templates WHERE intent_pattern = ?1",
                params![intent],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        if let Some((id, examples_json)) = existing {
            let mut examples: Vec<String> = serde_json::from_str(&examples_json).unwrap_or_default();
            examples.push(utterance.to_string());
            if examples.len() > MAX_TEMPLATE_EXAMPLES {
                examples.remove(0);
            }
            self.conn.execute(
                "UPDATE templates SET template_steps = ?1, example_inputs = ?2, successes = successes + 1,
                 confidence = MIN(1.0, confidence + 0.02) WHERE id = ?3",
                params![template_json, serde_json::to_string(&examples)?, id],
            )?;
        } else {
            let examples_json = serde_json::to_string(&vec![utterance.to_string()])?;
            self.conn.execute(
                "INSERT INTO templates (intent_pattern, template_steps, example_inputs) VALUES (?1, ?2, ?3)",
                params![intent, template_json, examples_json],
            )?;
        }
        Ok(())
    }

    /// `find_reasoning`: FTS over concrete chains first (ranked by
    /// `confidence * successes/(failures+1)`), falling back to the
    /// template table when no concrete match exists.
    pub fn find_reasoning(&mut self, utterance: &str, intent: Option<&str>) -> Result<Option<ReasoningChain>> {
        if let Some(chain) = self.find_concrete(utterance, intent)? {
            return Ok(Some(chain));
        }
        self.find_template(utterance, intent)
    }

    fn find_concrete(&mut self, utterance: &str, intent: Option<&str>) -> Result<Option<ReasoningChain>> {
        let keywords = Self::keywords_for(utterance);
        if keywords.is_empty() {
            return Ok(None);
        }
        let escaped = keywords
            .split_whitespace()
            .map(|w| format!("\"{w}\""))
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut stmt = self.conn.prepare(
            "SELECT cc.id, cc.intent, cc.steps, cc.variables, cc.confidence, cc.successes, cc.failures
             FROM chain_fts JOIN concrete_chains cc ON chain_fts.rowid = cc.id
             WHERE chain_fts MATCH ?1
             LIMIT 20",
        )?;
        let rows = stmt.query_map(params![escaped], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)? as f32,
                r.get::<_, i64>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })?;

        let mut best: Option<(f64, ReasoningChain)> = None;
        for row in rows {
            let (id, row_intent, steps_json, vars_json, confidence, successes, failures) = row?;
            if let Some(want) = intent {
                if row_intent != want {
                    continue;
                }
            }
            let score = confidence as f64 * (successes as f64 / (failures as f64 + 1.0));
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                let steps: Vec<String> = serde_json::from_str(&steps_json)?;
                let variables: HashMap<String, String> = serde_json::from_str(&vars_json)?;
                best = Some((
                    score,
                    ReasoningChain { id, intent: row_intent, steps, variables, confidence, is_template: false },
                ));
            }
        }
        Ok(best.map(|(_, chain)| adapt_chain(chain, utterance)))
    }

    fn find_template(&mut self, _utterance: &str, intent: Option<&str>) -> Result<Option<ReasoningChain>> {
        let row: Option<(i64, String, String, f32)> = if let Some(intent) = intent {
            self.conn
                .query_row(
                    "SELECT id, intent_pattern, template_steps, confidence FROM templates
                     WHERE intent_pattern = ?1 ORDER BY successes DESC LIMIT 1",
                    params![intent],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, f64>(3)? as f32)),
                )
                .optional()?
        } else {
            self.conn
                .query_row(
                    "SELECT id, intent_pattern, template_steps, confidence FROM templates
                     ORDER BY successes DESC LIMIT 1",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get::<_, f64>(3)? as f32)),
                )
                .optional()?
        };
        let Some((id, intent_pattern, steps_json, confidence)) = row else { return Ok(None) };
        let steps: Vec<String> = serde_json::from_str(&steps_json)?;
        // Most-used template without an embedding-backed similarity check: down-weight confidence.
        Ok(Some(ReasoningChain {
            id,
            intent: intent_pattern,
            steps,
            variables: HashMap::new(),
            confidence: confidence * 0.7,
            is_template: true,
        }))
    }

    pub fn feedback(&mut self, id: i64, is_template: bool, was_useful: bool) -> Result<()> {
        let table = if is_template { "templates" } else { "concrete_chains" };
        if was_useful {
            self.conn.execute(
                &format!("UPDATE {table} SET successes = successes + 1, confidence = MIN(1.0, confidence + 0.05) WHERE id = ?1"),
                params![id],
            )?;
        } else {
            self.conn.execute(
                &format!("UPDATE {table} SET failures = failures + 1, confidence = MAX(0.0, confidence - 0.15) WHERE id = ?1"),
                params![id],
            )?;
        }
        Ok(())
    }
}

fn top_keyword(text: &str) -> Option<String> {
    static STOP: &[&str] = &["the", "a", "an", "is", "are", "to", "of", "for", "and", "please", "can", "you"];
    let mut counts: HashMap<String, u32> = HashMap::new();
    for w in text.to_lowercase().split_whitespace() {
        let w = w.trim_matches(|c: char| !c.is_alphanumeric());
        if w.len() > 3 && !STOP.contains(&w) {
            *counts.entry(w.to_string()).or_insert(0) += 1;
        }
    }
    counts.into_iter().max_by_key(|(_, c)| *c).map(|(w, _)| w)
}

/// Substitutes variables extracted from the new utterance back into a
/// retrieved chain's steps, in place of the chain's original values.
fn adapt_chain(mut chain: ReasoningChain, utterance: &str) -> ReasoningChain {
    let fresh_vars = KnowledgeDistillation::extract_variables(utterance, "");
    for (key, new_value) in &fresh_vars {
        if let Some(old_value) = chain.variables.get(key).cloned() {
            if !old_value.is_empty() {
                for step in chain.steps.iter_mut() {
                    *step = step.replace(&old_value, new_value);
                }
            }
        }
        chain.variables.insert(key.clone(), new_value.clone());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, KnowledgeDistillation) {
        let dir = tempdir().unwrap();
        let kd = KnowledgeDistillation::open(&dir.path().join("knowledge_distillation.db")).unwrap();
        (dir, kd)
    }

    #[test]
    fn parses_numbered_list() {
        let steps = KnowledgeDistillation::parse_steps("1. Open the file\n2. Edit line 3\n3. Save it");
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], "Open the file");
    }

    #[test]
    fn parses_sequential_markers_when_no_list() {
        let steps = KnowledgeDistillation::parse_steps("First open the terminal. Then run the build. Finally check the logs.");
        assert!(steps.len() >= 2);
    }

    #[test]
    fn distill_then_find_returns_concrete_chain() {
        let (_d, mut kd) = fresh();
        kd.distill("create file report.txt", "1. Create report.txt\n2. Write the header", "create_file", true).unwrap();
        let found = kd.find_reasoning("create file report.txt", Some("create_file")).unwrap();
        assert!(found.is_some());
        assert!(!found.unwrap().is_template);
    }

    #[test]
    fn failed_distillation_is_not_stored() {
        let (_d, mut kd) = fresh();
        kd.distill("create file x.txt", "1. Create x.txt", "create_file", false).unwrap();
        let found = kd.find_reasoning("create file x.txt", Some("create_file")).unwrap();
        assert!(found.is_none());
    }
}
