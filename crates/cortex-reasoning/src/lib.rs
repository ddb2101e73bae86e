//! ChainOfThought and the KnowledgeDistillation store
//! it draws its `template` strategy from.

mod chain_of_thought;
mod distillation;

pub use chain_of_thought::{ChainOfThought, PastChain, ThoughtChain, ThoughtStep, ANALOGY_SIM_FLOOR, DEFAULT_STRATEGY_FLOOR};
pub use distillation::{KnowledgeDistillation, ReasoningChain};
