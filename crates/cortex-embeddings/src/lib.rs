//! Skip-gram word embeddings and IDF/positional/attention
//! sentence aggregation.

pub mod sentence;
pub mod word;

pub use sentence::{Level, SentenceEmbeddings};
pub use word::WordEmbeddings;
