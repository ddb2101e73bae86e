use thiserror::Error;

/// The four error kinds every component propagates distinctly.
///
/// External-dependency and persistence failures are recoverable by the
/// caller (routing falls back a tier, summarization falls back to
/// extractive); input-contract violations are skipped at the detection
/// site; programming errors are fatal for the current request only and
/// must never poison a component's durable state.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("dependency unavailable: {0}")]
    Dependency(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("input contract violation: {0}")]
    InputContract(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
