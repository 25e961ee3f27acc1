use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("unknown slave state: {0}")]
    UnknownSlaveState(String),

    #[error("unknown task state: {0}")]
    UnknownTaskState(String),

    #[error("unknown select strategy: {0} (expected: random|least-loaded|location-aware|round-robin)")]
    UnknownSelectStrategy(String),

    #[error("unknown split strategy: {0} (expected: equal|weighted)")]
    UnknownSplitStrategy(String),
}
