use std::collections::HashMap;

use cortex_core::math::cosine_similarity;

/// Tier 2.5: per-intent running-mean centroid classifier over sentence
/// embeddings. Replaces nothing concrete — it is the bridge between
/// the fixed regex rules (Tier 2) and the LLM fallback (Tier 3).
#[derive(Default)]
pub struct EmbeddingClassifier {
    centroids: HashMap<String, Vec<f32>>,
    counts: HashMap<String, u64>,
    threshold: f32,
}

impl EmbeddingClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { centroids: HashMap::new(), counts: HashMap::new(), threshold }
    }

    /// Incremental mean update: `centroid = (centroid*n + v) / (n+1)`.
    pub fn add_example(&mut self, intent: &str, vector: &[f32]) {
        let n = *self.counts.get(intent).unwrap_or(&0);
        let entry = self.centroids.entry(intent.to_string()).or_insert_with(|| vec![0.0; vector.len()]);
        if entry.len() != vector.len() {
            *entry = vec![0.0; vector.len()];
        }
        for (e, v) in entry.iter_mut().zip(vector) {
            *e = (*e * n as f32 + v) / (n as f32 + 1.0);
        }
        self.counts.insert(intent.to_string(), n + 1);
    }

    /// Best intent by cosine similarity to its centroid, if above threshold.
    pub fn classify(&self, vector: &[f32]) -> Option<(String, f32)> {
        let mut best: Option<(String, f32)> = None;
        for (intent, centroid) in &self.centroids {
            let sim = cosine_similarity(vector, centroid);
            if best.as_ref().map(|(_, s)| sim > *s).unwrap_or(true) {
                best = Some((intent.clone(), sim));
            }
        }
        best.filter(|(_, sim)| *sim >= self.threshold)
    }

    pub fn stats(&self) -> Vec<(String, u64)> {
        self.counts.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_into_nearest_trained_centroid() {
        let mut clf = EmbeddingClassifier::new(0.5);
        clf.add_example("get_weather", &[1.0, 0.0, 0.0]);
        clf.add_example("create_file", &[0.0, 1.0, 0.0]);
        let (intent, sim) = clf.classify(&[0.9, 0.1, 0.0]).unwrap();
        assert_eq!(intent, "get_weather");
        assert!(sim > 0.5);
    }

    #[test]
    fn below_threshold_returns_none() {
        let mut clf = EmbeddingClassifier::new(0.95);
        clf.add_example("get_weather", &[1.0, 0.0]);
        assert!(clf.classify(&[0.0, 1.0]).is_none());
    }
}
