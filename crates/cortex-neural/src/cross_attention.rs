use rand::Rng;
use serde::{Deserialize, Serialize};

use cortex_core::math::sigmoid;

pub const D_MODEL: usize = 128;
pub const D_MEMORY: usize = 1024;
pub const N_HEADS: usize = 4;
const HEAD_DIM: usize = D_MODEL / N_HEADS;

fn he_init(d_in: usize, d_out: usize, rng: &mut impl Rng) -> Vec<Vec<f32>> {
    let std = (2.0 / d_in as f32).sqrt();
    (0..d_in).map(|_| (0..d_out).map(|_| rng.random_range(-std..std)).collect()).collect()
}

fn matvec(w: &[Vec<f32>], x: &[f32]) -> Vec<f32> {
    let d_out = w[0].len();
    let mut out = vec![0.0f32; d_out];
    for (xi, row) in x.iter().zip(w) {
        for (o, wv) in out.iter_mut().zip(row) {
            *o += xi * wv;
        }
    }
    out
}

fn layer_norm(x: &[f32]) -> Vec<f32> {
    let mean = x.iter().sum::<f32>() / x.len() as f32;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / x.len() as f32;
    let inv = 1.0 / (var + 1e-5).sqrt();
    x.iter().map(|v| (v - mean) * inv).collect()
}

#[derive(Serialize, Deserialize)]
struct Weights {
    w_q: Vec<Vec<f32>>,   // D_MODEL x D_MODEL
    w_k: Vec<Vec<f32>>,   // D_MEMORY x D_MODEL
    w_v: Vec<Vec<f32>>,   // D_MEMORY x D_MODEL
    w_o: Vec<Vec<f32>>,   // D_MODEL x D_MODEL
    gate_w: Vec<f32>,     // 2*D_MODEL
    gate_b: f32,
}

/// CrossAttentionMemory: `Q` from the dialogue context, `K, V`
/// from retrieved memory vectors, fused back in by a scalar gate so an
/// empty or unhelpful memory set degrades to a no-op.
pub struct CrossAttentionMemory {
    weights: Weights,
    alpha_running_avg: f32,
    alpha_samples: u64,
}

impl CrossAttentionMemory {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            weights: Weights {
                w_q: he_init(D_MODEL, D_MODEL, &mut rng),
                w_k: he_init(D_MEMORY, D_MODEL, &mut rng),
                w_v: he_init(D_MEMORY, D_MODEL, &mut rng),
                w_o: he_init(D_MODEL, D_MODEL, &mut rng),
                gate_w: (0..2 * D_MODEL).map(|_| rng.random_range(-0.05..0.05)).collect(),
                gate_b: 0.0,
            },
            alpha_running_avg: 0.0,
            alpha_samples: 0,
        }
    }

    /// `memory` is a list of `D_MEMORY`-dimensional retrieved vectors.
    /// Empty memory returns `context` unchanged.
    pub fn forward(&mut self, context: &[f32], memory: &[Vec<f32>]) -> Vec<f32> {
        if memory.is_empty() {
            return context.to_vec();
        }

        let q = matvec(&self.weights.w_q, context);
        let keys: Vec<Vec<f32>> = memory.iter().map(|m| matvec(&self.weights.w_k, m)).collect();
        let values: Vec<Vec<f32>> = memory.iter().map(|m| matvec(&self.weights.w_v, m)).collect();

        let scale = 1.0 / (HEAD_DIM as f32).sqrt();
        let mut concat = vec![0.0f32; D_MODEL];
        for h in 0..N_HEADS {
            let start = h * HEAD_DIM;
            let scores: Vec<f32> = keys
                .iter()
                .map(|k| q[start..start + HEAD_DIM].iter().zip(&k[start..start + HEAD_DIM]).map(|(a, b)| a * b).sum::<f32>() * scale)
                .collect();
            let max = scores.iter().cloned().fold(f32::MIN, f32::max);
            let exps: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            for (j, v) in values.iter().enumerate() {
                let w = exps[j] / sum.max(1e-9);
                for d in 0..HEAD_DIM {
                    concat[start + d] += w * v[start + d];
                }
            }
        }

        let attn_out = matvec(&self.weights.w_o, &concat);
        let normed = layer_norm(&attn_out);

        let mut gate_input = context.to_vec();
        gate_input.extend_from_slice(&attn_out);
        let dot: f32 = gate_input.iter().zip(&self.weights.gate_w).map(|(a, b)| a * b).sum::<f32>() + self.weights.gate_b;
        let alpha = sigmoid(dot);

        self.alpha_samples += 1;
        self.alpha_running_avg += (alpha - self.alpha_running_avg) / self.alpha_samples as f32;

        context.iter().zip(&normed).map(|(c, n)| (1.0 - alpha) * c + alpha * n).collect()
    }

    pub fn alpha_running_average(&self) -> f32 {
        self.alpha_running_avg
    }
}

impl Default for CrossAttentionMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_memory_is_a_no_op() {
        let mut cam = CrossAttentionMemory::new();
        let context = vec![0.3f32; D_MODEL];
        let out = cam.forward(&context, &[]);
        assert_eq!(out, context);
    }

    #[test]
    fn nonempty_memory_produces_same_dimensional_output() {
        let mut cam = CrossAttentionMemory::new();
        let context = vec![0.1f32; D_MODEL];
        let memory = vec![vec![0.2f32; D_MEMORY], vec![-0.1f32; D_MEMORY]];
        let out = cam.forward(&context, &memory);
        assert_eq!(out.len(), D_MODEL);
    }

    #[test]
    fn alpha_running_average_updates_after_use() {
        let mut cam = CrossAttentionMemory::new();
        let context = vec![0.1f32; D_MODEL];
        let memory = vec![vec![0.2f32; D_MEMORY]];
        cam.forward(&context, &memory);
        assert!(cam.alpha_running_average().is_finite());
    }
}
