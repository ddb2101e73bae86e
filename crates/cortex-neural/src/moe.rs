use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cortex_core::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const D_MODEL: usize = 128;
pub const N_EXPERTS: usize = 4;
pub const D_EXPERT: usize = 256;
pub const TOP_K: usize = 2;
pub const BALANCE_COEFF: f32 = 0.01;
pub const KEYWORD_BIAS_STEPS: u64 = 200;
const PERSIST_EVERY: u64 = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Expert {
    w1: Vec<Vec<f32>>, // D_MODEL x D_EXPERT
    b1: Vec<f32>,
    w2: Vec<Vec<f32>>, // D_EXPERT x D_MODEL
    b2: Vec<f32>,
}

impl Expert {
    fn he_init(d_in: usize, d_out: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
        let std = (2.0 / d_in as f32).sqrt();
        (0..d_in).map(|_| (0..d_out).map(|_| rng.random_range(-std..std)).collect()).collect()
    }

    fn new(rng: &mut impl Rng) -> Self {
        Self {
            w1: Self::he_init(D_MODEL, D_EXPERT, rng),
            b1: vec![0.0; D_EXPERT],
            w2: Self::he_init(D_EXPERT, D_MODEL, rng),
            b2: vec![0.0; D_MODEL],
        }
    }

    /// Returns `(pre_relu, hidden, output)` so the caller can backprop
    /// without recomputing the forward pass.
    fn forward(&self, x: &[f32]) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        let mut z1 = self.b1.clone();
        for (i, row) in self.w1.iter().enumerate() {
            for (j, w) in row.iter().enumerate() {
                z1[j] += x[i] * w;
            }
        }
        let h: Vec<f32> = z1.iter().map(|&v| v.max(0.0)).collect();

        let mut out = self.b2.clone();
        for (i, row) in self.w2.iter().enumerate() {
            for (j, w) in row.iter().enumerate() {
                out[j] += h[i] * w;
            }
        }
        (z1, h, out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RouterWeights {
    w_gate: Vec<Vec<f32>>, // D_MODEL x N_EXPERTS
    b_gate: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    experts: Vec<Expert>,
    router: RouterWeights,
    routing_counts: Vec<u64>,
    train_steps: u64,
}

/// MixtureOfExperts: residual block `y = x + Σ gate_i · Expert_i(x)`.
pub struct MixtureOfExperts {
    path: PathBuf,
    experts: Vec<Expert>,
    router: RouterWeights,
    routing_counts: Vec<u64>,
    train_steps: u64,
    top_k: usize,
}

impl MixtureOfExperts {
    pub fn open(path: &Path) -> Result<Self> {
        if let Ok(bytes) = std::fs::read(path) {
            if let Ok(snap) = serde_json::from_slice::<Snapshot>(&bytes) {
                return Ok(Self {
                    path: path.to_path_buf(),
                    experts: snap.experts,
                    router: snap.router,
                    routing_counts: snap.routing_counts,
                    train_steps: snap.train_steps,
                    top_k: TOP_K,
                });
            }
        }
        let mut rng = rand::rng();
        Ok(Self {
            path: path.to_path_buf(),
            experts: (0..N_EXPERTS).map(|_| Expert::new(&mut rng)).collect(),
            router: RouterWeights {
                w_gate: (0..D_MODEL).map(|_| vec![0.0; N_EXPERTS]).collect(),
                b_gate: vec![0.0; N_EXPERTS],
            },
            routing_counts: vec![0; N_EXPERTS],
            train_steps: 0,
            top_k: TOP_K,
        })
    }

    fn gate_logits(&self, x: &[f32], keyword_bias: Option<&[f32]>, training: bool) -> Vec<f32> {
        let mut logits = self.router.b_gate.clone();
        for (i, row) in self.router.w_gate.iter().enumerate() {
            for (j, w) in row.iter().enumerate() {
                logits[j] += x[i] * w;
            }
        }
        if training {
            let mut rng = rand::rng();
            for l in logits.iter_mut() {
                *l += rng.random_range(-0.1..0.1);
            }
        }
        if let Some(bias) = keyword_bias {
            let anneal = 1.0 - (self.train_steps as f32 / KEYWORD_BIAS_STEPS as f32).min(1.0);
            for (l, b) in logits.iter_mut().zip(bias) {
                *l += b * anneal;
            }
        }
        logits
    }

    fn softmax_top_k(&self, logits: &[f32]) -> Vec<(usize, f32)> {
        let max = logits.iter().cloned().fold(f32::MIN, f32::max);
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let probs: Vec<f32> = exps.iter().map(|&e| e / sum.max(1e-9)).collect();

        let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        indexed.truncate(self.top_k);
        let renorm: f32 = indexed.iter().map(|(_, p)| p).sum();
        indexed.into_iter().map(|(i, p)| (i, p / renorm.max(1e-9))).collect()
    }

    /// Forward pass: `y = x + Σ_{i∈topK} gate_i · Expert_i(x)`.
    pub fn forward(&self, x: &[f32], keyword_bias: Option<&[f32]>) -> Vec<f32> {
        let logits = self.gate_logits(x, keyword_bias, false);
        let active = self.softmax_top_k(&logits);
        let mut y = x.to_vec();
        for (i, gate) in &active {
            let (_, _, out) = self.experts[*i].forward(x);
            for (yv, ov) in y.iter_mut().zip(&out) {
                *yv += gate * ov;
            }
        }
        y
    }

    /// Gradient-free (in the backprop-framework sense) training step:
    /// explicit MSE/ReLU gradients, scaled by each active expert's gate
    /// weight, plus a router bias nudge and a load-balance penalty.
    pub fn train_step(&mut self, x: &[f32], target: &[f32], lr: f32, keyword_bias: Option<&[f32]>) -> f32 {
        let logits = self.gate_logits(x, keyword_bias, true);
        let active = self.softmax_top_k(&logits);

        let mut y = x.to_vec();
        let mut forwards = Vec::with_capacity(active.len());
        for (i, gate) in &active {
            let (z1, h, out) = self.experts[*i].forward(x);
            for (yv, ov) in y.iter_mut().zip(&out) {
                *yv += gate * ov;
            }
            forwards.push((*i, *gate, z1, h, out));
        }

        let error: Vec<f32> = y.iter().zip(target).map(|(a, b)| a - b).collect();
        let loss = error.iter().map(|e| e * e).sum::<f32>() / error.len() as f32;
        let d_y: Vec<f32> = error.iter().map(|e| 2.0 * e / error.len() as f32).collect();

        for (i, gate, z1, h, _out) in &forwards {
            let expert = &mut self.experts[*i];
            let d_out: Vec<f32> = d_y.iter().map(|d| d * gate).collect();

            for (row_idx, row) in expert.w2.iter_mut().enumerate() {
                for (col_idx, w) in row.iter_mut().enumerate() {
                    *w -= lr * h[row_idx] * d_out[col_idx];
                }
            }
            for (b, d) in expert.b2.iter_mut().zip(&d_out) {
                *b -= lr * d;
            }

            let mut d_h = vec![0.0f32; D_EXPERT];
            for (row_idx, row) in expert.w2.iter().enumerate() {
                for (col_idx, w) in row.iter().enumerate() {
                    d_h[row_idx] += w * d_out[col_idx];
                }
            }
            let d_z1: Vec<f32> = d_h.iter().zip(z1).map(|(dh, &z)| if z > 0.0 { *dh } else { 0.0 }).collect();

            for (row_idx, row) in expert.w1.iter_mut().enumerate() {
                for (col_idx, w) in row.iter_mut().enumerate() {
                    *w -= lr * x[row_idx] * d_z1[col_idx];
                }
            }
            for (b, d) in expert.b1.iter_mut().zip(&d_z1) {
                *b -= lr * d;
            }

            self.routing_counts[*i] += 1;
        }

        let total: u64 = self.routing_counts.iter().sum::<u64>().max(1);
        let ideal = total as f32 / N_EXPERTS as f32;
        for (i, _gate, ..) in &forwards {
            self.router.b_gate[*i] += lr * ((-loss).exp() - 0.5) * 0.1;
            let imbalance = (self.routing_counts[*i] as f32 - ideal) / total as f32;
            self.router.b_gate[*i] -= lr * BALANCE_COEFF * imbalance;
        }

        self.train_steps += 1;
        if self.train_steps % PERSIST_EVERY == 0 {
            let _ = self.persist();
        }
        loss
    }

    pub fn persist(&self) -> Result<()> {
        let snap = Snapshot {
            experts: self.experts.clone(),
            router: self.router.clone(),
            routing_counts: self.routing_counts.clone(),
            train_steps: self.train_steps,
        };
        let bytes = serde_json::to_vec_pretty(&snap)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub fn routing_counts(&self) -> &[u64] {
        &self.routing_counts
    }
}

/// Per-expert category-word counts, annealed into the router logits
/// during the first ~200 training steps.
pub fn keyword_bias(categories: &[Vec<&str>], text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut counts: HashMap<usize, f32> = HashMap::new();
    for (i, words) in categories.iter().enumerate() {
        let c = words.iter().filter(|w| lower.contains(*w)).count();
        if c > 0 {
            counts.insert(i, c as f32);
        }
    }
    (0..N_EXPERTS).map(|i| *counts.get(&i).unwrap_or(&0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn forward_is_residual_when_gates_are_tiny() {
        let dir = tempdir().unwrap();
        let moe = MixtureOfExperts::open(&dir.path().join("moe.json")).unwrap();
        let x = vec![0.01f32; D_MODEL];
        let y = moe.forward(&x, None);
        assert_eq!(y.len(), D_MODEL);
    }

    #[test]
    fn train_step_reduces_loss_over_iterations() {
        let dir = tempdir().unwrap();
        let mut moe = MixtureOfExperts::open(&dir.path().join("moe.json")).unwrap();
        let x = vec![0.1f32; D_MODEL];
        let target = vec![0.2f32; D_MODEL];
        let first = moe.train_step(&x, &target, 0.01, None);
        let mut last = first;
        for _ in 0..50 {
            last = moe.train_step(&x, &target, 0.01, None);
        }
        assert!(last <= first);
    }

    #[test]
    fn reload_restores_routing_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("moe.json");
        {
            let mut moe = MixtureOfExperts::open(&path).unwrap();
            for _ in 0..50 {
                moe.train_step(&vec![0.1; D_MODEL], &vec![0.0; D_MODEL], 0.01, None);
            }
        }
        let reloaded = MixtureOfExperts::open(&path).unwrap();
        assert!(reloaded.routing_counts().iter().sum::<u64>() > 0);
    }
}
