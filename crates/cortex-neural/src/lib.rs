//! The four from-scratch neural components: MixtureOfExperts,
//! MicroTransformer, ConditionalGeneration, and CrossAttentionMemory.

pub mod conditional;
pub mod cross_attention;
pub mod moe;
pub mod transformer;

pub use conditional::{Axis, Condition, ConditionalGeneration};
pub use cross_attention::CrossAttentionMemory;
pub use moe::MixtureOfExperts;
pub use transformer::MicroTransformer;
