use std::collections::{HashMap, HashSet};
use std::path::Path;

use cortex_core::db::{decode_vector, encode_vector, open_component_db};
use cortex_core::math::{cosine_similarity, l2_normalize};
use cortex_core::Result;
use rusqlite::{params, Connection};

use crate::word::WordEmbeddings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    IdfMean,
    Positional,
    Attention,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// IDF-weighted / positional / learned-attention sentence aggregation
/// over word vectors from `WordEmbeddings`.
pub struct SentenceEmbeddings {
    conn: Connection,
    dim: usize,
    doc_freq: HashMap<String, u64>,
    total_docs: u64,
    attention_w: Vec<f32>,
    attention_trained: bool,
}

impl SentenceEmbeddings {
    pub fn open(path: &Path, dim: usize) -> Result<Self> {
        let conn = open_component_db(path)?;
        Self::create_schema(&conn)?;
        let mut store = Self {
            conn,
            dim,
            doc_freq: HashMap::new(),
            total_docs: 0,
            attention_w: vec![0.0; dim],
            attention_trained: false,
        };
        store.load()?;
        Ok(store)
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS word_doc_freq (word TEXT PRIMARY KEY, doc_count INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE IF NOT EXISTS attention_weights (id INTEGER PRIMARY KEY CHECK (id = 0), vector BLOB NOT NULL, trained INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE IF NOT EXISTS embedding_cache (text_hash TEXT PRIMARY KEY, vector BLOB NOT NULL);
             CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
        )?;
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare("SELECT word, doc_count FROM word_doc_freq")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))?;
        for row in rows {
            let (w, c) = row?;
            self.doc_freq.insert(w, c);
        }

        let total: Option<String> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'total_docs'", [], |r| r.get(0))
            .ok();
        if let Some(t) = total {
            self.total_docs = t.parse().unwrap_or(0);
        }

        let row: Option<(Vec<u8>, i64)> = self
            .conn
            .query_row("SELECT vector, trained FROM attention_weights WHERE id = 0", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .ok();
        if let Some((blob, trained)) = row {
            let v = decode_vector(&blob);
            if v.len() == self.dim {
                self.attention_w = v;
                self.attention_trained = trained != 0;
            }
        }
        Ok(())
    }

    /// Registers `text` as a document for IDF purposes. Safe to call
    /// multiple times; each unique word is counted once per call.
    pub fn observe_document(&mut self, text: &str) -> Result<()> {
        let words: HashSet<String> = tokenize(text).into_iter().collect();
        self.total_docs += 1;
        for w in &words {
            *self.doc_freq.entry(w.clone()).or_insert(0) += 1;
        }
        let tx = self.conn.unchecked_transaction()?;
        for w in &words {
            let c = self.doc_freq[w];
            tx.execute(
                "INSERT INTO word_doc_freq(word, doc_count) VALUES (?1, ?2)
                 ON CONFLICT(word) DO UPDATE SET doc_count = excluded.doc_count",
                params![w, c as i64],
            )?;
        }
        tx.execute(
            "INSERT INTO meta(key, value) VALUES ('total_docs', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![self.total_docs.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn idf(&self, word: &str) -> f32 {
        let df = self.doc_freq.get(word).copied().unwrap_or(0) as f32;
        let n = self.total_docs.max(1) as f32;
        (n / (df + 1.0)).ln() + 1.0
    }

    fn positional_encoding(&self, pos: usize) -> Vec<f32> {
        let mut pe = vec![0.0f32; self.dim];
        for i in 0..self.dim / 2 {
            let denom = 10000f32.powf((2 * i) as f32 / self.dim as f32);
            pe[2 * i] = (pos as f32 / denom).sin();
            if 2 * i + 1 < self.dim {
                pe[2 * i + 1] = (pos as f32 / denom).cos();
            }
        }
        pe
    }

    /// `encode(text, level)`. Returns `None` iff no word in `text` has
    /// a previously-known vector. Level 3 falls back to Level 2 until
    /// `train_attention` has run at least once.
    pub fn encode(&mut self, text: &str, level: Level, words: &mut WordEmbeddings) -> Option<Vec<f32>> {
        let level = if level == Level::Attention && !self.attention_trained {
            Level::Positional
        } else {
            level
        };

        let tokens = tokenize(text);
        let known: Vec<(usize, String, Vec<f32>)> = tokens
            .iter()
            .enumerate()
            .filter_map(|(i, w)| words.peek(w).map(|v| (i, w.clone(), v)))
            .collect();
        if known.is_empty() {
            return None;
        }

        match level {
            Level::IdfMean => Some(self.idf_mean(&known)),
            Level::Positional => Some(self.positional_mean(&known)),
            Level::Attention => Some(self.attention_pool(&known)),
        }
    }

    fn idf_mean(&self, known: &[(usize, String, Vec<f32>)]) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dim];
        let mut total_w = 0.0f32;
        for (_, word, v) in known {
            let w = self.idf(word);
            for k in 0..self.dim.min(v.len()) {
                acc[k] += w * v[k];
            }
            total_w += w;
        }
        if total_w > 0.0 {
            for x in acc.iter_mut() {
                *x /= total_w;
            }
        }
        l2_normalize(&mut acc);
        acc
    }

    fn positional_mean(&self, known: &[(usize, String, Vec<f32>)]) -> Vec<f32> {
        let mut acc = vec![0.0f32; self.dim];
        let mut total_w = 0.0f32;
        for (pos, word, v) in known {
            let w = self.idf(word);
            let pe = self.positional_encoding(*pos);
            for k in 0..self.dim.min(v.len()) {
                acc[k] += w * (v[k] + 0.1 * pe[k]);
            }
            total_w += w;
        }
        if total_w > 0.0 {
            for x in acc.iter_mut() {
                *x /= total_w;
            }
        }
        l2_normalize(&mut acc);
        acc
    }

    fn attention_pool(&self, known: &[(usize, String, Vec<f32>)]) -> Vec<f32> {
        let scores: Vec<f32> = known
            .iter()
            .map(|(_, _, v)| v.iter().zip(&self.attention_w).map(|(a, b)| a * b).sum())
            .collect();
        let max = scores.iter().cloned().fold(f32::MIN, f32::max);
        let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        let weights: Vec<f32> = if sum > 0.0 {
            exp.iter().map(|e| e / sum).collect()
        } else {
            vec![1.0 / known.len() as f32; known.len()]
        };

        let mut acc = vec![0.0f32; self.dim];
        for ((_, _, v), w) in known.iter().zip(&weights) {
            for k in 0..self.dim.min(v.len()) {
                acc[k] += w * v[k];
            }
        }
        l2_normalize(&mut acc);
        acc
    }

    pub fn similarity(&mut self, a: &str, b: &str, level: Level, words: &mut WordEmbeddings) -> f32 {
        let va = self.encode(a, level, words);
        let vb = self.encode(b, level, words);
        match (va, vb) {
            (Some(va), Some(vb)) => cosine_similarity(&va, &vb),
            _ => 0.0,
        }
    }

    /// Pairwise hinge-loss training of the Level-3 attention projection.
    /// `pairs` are `(positive, negative)` text pairs sharing an anchor
    /// implicitly encoded in how callers build them. A finite-difference
    /// estimate approximates the gradient along each attention dimension.
    pub fn train_attention(
        &mut self,
        anchor: &str,
        positive: &str,
        negative: &str,
        lr: f32,
        words: &mut WordEmbeddings,
    ) -> Result<f32> {
        const EPS: f32 = 1e-3;

        let loss_fn = |this: &Self, words: &mut WordEmbeddings| -> f32 {
            let a = this.encode_with_weights(anchor, &this.attention_w, words);
            let p = this.encode_with_weights(positive, &this.attention_w, words);
            let n = this.encode_with_weights(negative, &this.attention_w, words);
            match (a, p, n) {
                (Some(a), Some(p), Some(n)) => {
                    let sim_p = cosine_similarity(&a, &p);
                    let sim_n = cosine_similarity(&a, &n);
                    (1.0 - sim_p).max(0.0) + (sim_n - 0.5).max(0.0)
                }
                _ => 0.0,
            }
        };

        let base_loss = loss_fn(self, words);
        let mut grad = vec![0.0f32; self.dim];
        for k in 0..self.dim {
            self.attention_w[k] += EPS;
            let bumped = loss_fn(self, words);
            self.attention_w[k] -= EPS;
            grad[k] = (bumped - base_loss) / EPS;
        }
        for k in 0..self.dim {
            self.attention_w[k] -= lr * grad[k];
        }
        self.attention_trained = true;
        self.persist_attention()?;
        Ok(base_loss)
    }

    fn encode_with_weights(&self, text: &str, w: &[f32], words: &mut WordEmbeddings) -> Option<Vec<f32>> {
        let tokens = tokenize(text);
        let known: Vec<Vec<f32>> = tokens.iter().filter_map(|t| words.peek(t)).collect();
        if known.is_empty() {
            return None;
        }
        let scores: Vec<f32> = known.iter().map(|v| v.iter().zip(w).map(|(a, b)| a * b).sum()).collect();
        let max = scores.iter().cloned().fold(f32::MIN, f32::max);
        let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
        let sum: f32 = exp.iter().sum();
        let mut acc = vec![0.0f32; self.dim];
        for (v, s) in known.iter().zip(&exp) {
            let weight = if sum > 0.0 { s / sum } else { 1.0 / known.len() as f32 };
            for k in 0..self.dim.min(v.len()) {
                acc[k] += weight * v[k];
            }
        }
        l2_normalize(&mut acc);
        Some(acc)
    }

    fn persist_attention(&self) -> Result<()> {
        self.conn.execute(
            "INSERT INTO attention_weights(id, vector, trained) VALUES (0, ?1, 1)
             ON CONFLICT(id) DO UPDATE SET vector = excluded.vector, trained = 1",
            params![encode_vector(&self.attention_w)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, SentenceEmbeddings, WordEmbeddings) {
        let dir = tempdir().unwrap();
        let se = SentenceEmbeddings::open(&dir.path().join("sentence_embeddings.db"), 16).unwrap();
        let we = WordEmbeddings::open(&dir.path().join("word_embeddings.db"), 16).unwrap();
        (dir, se, we)
    }

    #[test]
    fn unknown_text_returns_none() {
        let (_dir, mut se, mut we) = setup();
        assert!(se.encode("completely unseen text", Level::IdfMean, &mut we).is_none());
    }

    #[test]
    fn known_words_produce_normalized_vector() {
        let (_dir, mut se, mut we) = setup();
        we.encode("hello");
        we.encode("world");
        let v = se.encode("hello world", Level::IdfMean, &mut we).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3 || norm == 0.0);
    }

    #[test]
    fn level3_falls_back_until_trained() {
        let (_dir, mut se, mut we) = setup();
        we.encode("hello");
        let l3 = se.encode("hello", Level::Attention, &mut we);
        let l2 = se.encode("hello", Level::Positional, &mut we);
        assert_eq!(l3, l2);
    }

    #[test]
    fn similarity_is_symmetric_via_cosine() {
        let (_dir, mut se, mut we) = setup();
        we.encode("cat");
        we.encode("dog");
        let sim_ab = se.similarity("cat", "dog", Level::IdfMean, &mut we);
        let sim_ba = se.similarity("dog", "cat", Level::IdfMean, &mut we);
        assert!((sim_ab - sim_ba).abs() < 1e-5);
    }
}
