use std::collections::HashMap;
use std::path::Path;

use cortex_core::db::{decode_vector, encode_vector, open_component_db};
use cortex_core::math::{clamp01, sigmoid};
use cortex_core::Result;
use rand::Rng;
use rusqlite::{params, Connection};

pub const DEFAULT_DIM: usize = 128;
pub const MAX_WINDOW: usize = 5;
pub const NEGATIVE_SAMPLES: usize = 5;
pub const LR_MAX: f32 = 0.025;
pub const LR_MIN: f32 = 0.0001;
const DECAY_HORIZON: u64 = 200_000;

/// Skip-gram word embeddings with negative sampling.
pub struct WordEmbeddings {
    conn: Connection,
    dim: usize,
    negative_samples: usize,
    max_window: usize,
    lr_max: f32,
    lr_min: f32,

    vectors: HashMap<String, Vec<f32>>,
    frequencies: HashMap<String, u64>,
    unigram_table: Vec<String>,
    total_tokens: u64,
}

impl WordEmbeddings {
    pub fn open(path: &Path, dim: usize) -> Result<Self> {
        let conn = open_component_db(path)?;
        Self::create_schema(&conn)?;
        let mut store = Self {
            conn,
            dim,
            negative_samples: NEGATIVE_SAMPLES,
            max_window: MAX_WINDOW,
            lr_max: LR_MAX,
            lr_min: LR_MIN,
            vectors: HashMap::new(),
            frequencies: HashMap::new(),
            unigram_table: Vec::new(),
            total_tokens: 0,
        };
        store.load()?;
        Ok(store)
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vocabulary (
                word TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                frequency INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS bigrams (
                token_a TEXT NOT NULL,
                token_b TEXT NOT NULL,
                frequency INTEGER NOT NULL DEFAULT 0,
                UNIQUE(token_a, token_b)
            );
            CREATE TABLE IF NOT EXISTS trigrams (
                token_a TEXT NOT NULL,
                token_b TEXT NOT NULL,
                token_c TEXT NOT NULL,
                frequency INTEGER NOT NULL DEFAULT 0,
                UNIQUE(token_a, token_b, token_c)
            );
            CREATE TABLE IF NOT EXISTS associations (word TEXT, related TEXT, weight REAL);
            CREATE TABLE IF NOT EXISTS word_situations (word TEXT, situation TEXT);",
        )?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare("SELECT word, vector, frequency FROM vocabulary")?;
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?, r.get::<_, i64>(2)? as u64))
        })?;
        let mut to_repersist = Vec::new();
        for row in rows {
            let (word, blob, freq) = row?;
            let mut vec = decode_vector(&blob);
            if vec.len() < self.dim {
                // Dimension migration: pad shorter stored vectors with
                // small random values and schedule a re-persist.
                let mut rng = rand::rng();
                while vec.len() < self.dim {
                    vec.push(rng.random_range(-0.01..0.01));
                }
                to_repersist.push((word.clone(), vec.clone()));
            } else if vec.len() > self.dim {
                return Err(cortex_core::CoreError::Invariant(format!(
                    "stored word vector for '{word}' is longer than configured dim {}",
                    self.dim
                )));
            }
            self.frequencies.insert(word.clone(), freq);
            self.vectors.insert(word, vec);
        }
        for (word, vec) in to_repersist {
            self.persist_vector(&word, &vec)?;
        }
        self.rebuild_unigram_table();
        Ok(())
    }

    fn persist_vector(&self, word: &str, vec: &[f32]) -> Result<()> {
        let freq = self.frequencies.get(word).copied().unwrap_or(0);
        self.conn.execute(
            "INSERT INTO vocabulary(word, vector, frequency) VALUES (?1, ?2, ?3)
             ON CONFLICT(word) DO UPDATE SET vector = excluded.vector, frequency = excluded.frequency",
            params![word, encode_vector(vec), freq as i64],
        )?;
        Ok(())
    }

    fn rebuild_unigram_table(&mut self) {
        // Sampling table weighted by freq^0.75, capped to keep memory bounded.
        self.unigram_table.clear();
        const TABLE_SIZE: usize = 100_000;
        let total: f64 = self.frequencies.values().map(|&f| (f as f64).powf(0.75)).sum();
        if total <= 0.0 {
            return;
        }
        for (word, freq) in &self.frequencies {
            let share = (*freq as f64).powf(0.75) / total;
            let slots = (share * TABLE_SIZE as f64).round() as usize;
            for _ in 0..slots.max(1).min(TABLE_SIZE) {
                self.unigram_table.push(word.clone());
                if self.unigram_table.len() >= TABLE_SIZE {
                    break;
                }
            }
        }
    }

    fn current_lr(&self) -> f32 {
        let t = (self.total_tokens as f32 / DECAY_HORIZON as f32).min(1.0);
        self.lr_max - (self.lr_max - self.lr_min) * t
    }

    /// `encode(word)`: returns the current vector, or creates one
    /// initialized to small Gaussian noise on first sighting.
    pub fn encode(&mut self, word: &str) -> Vec<f32> {
        if let Some(v) = self.vectors.get(word) {
            return v.clone();
        }
        let mut rng = rand::rng();
        let v: Vec<f32> = (0..self.dim).map(|_| rng.random_range(-0.05..0.05)).collect();
        self.vectors.insert(word.to_string(), v.clone());
        v
    }

    fn sample_negatives(&self, positive: &str, n: usize) -> Vec<String> {
        if self.unigram_table.is_empty() {
            return Vec::new();
        }
        let mut rng = rand::rng();
        let mut out = Vec::with_capacity(n);
        let mut guard = 0;
        while out.len() < n && guard < n * 20 {
            guard += 1;
            let idx = rng.random_range(0..self.unigram_table.len());
            let candidate = &self.unigram_table[idx];
            if candidate != positive {
                out.push(candidate.clone());
            }
        }
        out
    }

    /// Trains skip-gram on one token sequence (already split into
    /// lowercase word strings). Bigram/trigram tables are updated in
    /// the same commit as the vector table so a crash cannot orphan one.
    pub fn train_on_tokens(&mut self, tokens: &[String]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }

        for w in tokens {
            *self.frequencies.entry(w.clone()).or_insert(0) += 1;
            self.encode(w);
        }
        self.rebuild_unigram_table();

        let tx = self.conn.unchecked_transaction()?;
        for i in 0..tokens.len() {
            let center = &tokens[i];
            let mut rng = rand::rng();
            let window = rng.random_range(1..=self.max_window);
            let lo = i.saturating_sub(window);
            let hi = (i + window + 1).min(tokens.len());

            for j in lo..hi {
                if j == i {
                    continue;
                }
                let context = tokens[j].clone();
                self.skipgram_update(center, &context, 1.0);
                for neg in self.sample_negatives(&context, self.negative_samples) {
                    self.skipgram_update(center, &neg, 0.0);
                }
            }

            if i + 1 < tokens.len() {
                tx.execute(
                    "INSERT INTO bigrams(token_a, token_b, frequency) VALUES (?1, ?2, 1)
                     ON CONFLICT(token_a, token_b) DO UPDATE SET frequency = frequency + 1",
                    params![tokens[i], tokens[i + 1]],
                )?;
            }
            if i + 2 < tokens.len() {
                tx.execute(
                    "INSERT INTO trigrams(token_a, token_b, token_c, frequency) VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT(token_a, token_b, token_c) DO UPDATE SET frequency = frequency + 1",
                    params![tokens[i], tokens[i + 1], tokens[i + 2]],
                )?;
            }
            self.total_tokens += 1;
        }

        for (word, vec) in self.vectors.clone() {
            let freq = self.frequencies.get(&word).copied().unwrap_or(0);
            tx.execute(
                "INSERT INTO vocabulary(word, vector, frequency) VALUES (?1, ?2, ?3)
                 ON CONFLICT(word) DO UPDATE SET vector = excluded.vector, frequency = excluded.frequency",
                params![word, encode_vector(&vec), freq as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn skipgram_update(&mut self, center: &str, other: &str, label: f32) {
        let lr = self.current_lr();
        let mut center_v = self.vectors.get(center).cloned().unwrap_or_else(|| self.encode(center));
        let mut other_v = self.vectors.get(other).cloned().unwrap_or_else(|| self.encode(other));

        let dot: f32 = center_v.iter().zip(&other_v).map(|(a, b)| a * b).sum::<f32>().clamp(-6.0, 6.0);
        let pred = sigmoid(dot);
        let error = label - pred;

        for k in 0..self.dim {
            let grad_center = lr * error * other_v[k];
            let grad_other = lr * error * center_v[k];
            center_v[k] += grad_center;
            other_v[k] += grad_other;
        }

        self.vectors.insert(center.to_string(), center_v);
        self.vectors.insert(other.to_string(), other_v);
    }

    /// Non-mutating lookup — unlike `encode`, never creates a vector.
    pub fn peek(&self, word: &str) -> Option<Vec<f32>> {
        self.vectors.get(word).cloned()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.vectors.contains_key(word)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vocab_size(&self) -> usize {
        self.vectors.len()
    }

    /// Fraction of `text`'s whitespace-split tokens present in the
    /// trained vocabulary — the `known_words_fraction` signal fed into
    /// `ActiveLearning::assess_confidence`.
    pub fn known_words_fraction(&self, text: &str) -> f32 {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return 0.0;
        }
        let known = tokens.iter().filter(|t| self.contains(&t.to_lowercase())).count();
        clamp01(known as f32 / tokens.len() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_tokens() -> Vec<String> {
        "the quick brown fox jumps over the lazy dog the fox runs"
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn first_sighting_creates_vector() {
        let dir = tempdir().unwrap();
        let mut we = WordEmbeddings::open(&dir.path().join("word_embeddings.db"), 16).unwrap();
        let v = we.encode("hello");
        assert_eq!(v.len(), 16);
        assert_eq!(we.encode("hello"), v);
    }

    #[test]
    fn training_updates_vectors_and_cooccurrence() {
        let dir = tempdir().unwrap();
        let mut we = WordEmbeddings::open(&dir.path().join("word_embeddings.db"), 16).unwrap();
        we.train_on_tokens(&sample_tokens()).unwrap();
        assert!(we.vocab_size() >= 6);

        let count: i64 = we
            .conn
            .query_row("SELECT COUNT(*) FROM bigrams", [], |r| r.get(0))
            .unwrap();
        assert!(count > 0);
    }

    #[test]
    fn reload_preserves_vectors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("word_embeddings.db");
        {
            let mut we = WordEmbeddings::open(&path, 16).unwrap();
            we.train_on_tokens(&sample_tokens()).unwrap();
        }
        let mut we2 = WordEmbeddings::open(&path, 16).unwrap();
        assert!(we2.vocab_size() > 0);
        let v = we2.encode("fox");
        assert_eq!(v.len(), 16);
    }
}
