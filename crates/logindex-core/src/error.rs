//! Error types for the indexing pipeline.

use thiserror::Error;

/// Errors that can occur while indexing.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("log error: {0}")]
    Log(String),

    #[error("batch handler error: {0}")]
    Batch(String),

    #[error("indexer is closed")]
    Closed,

    #[error("indexer is already closing")]
    AlreadyClosing,

    #[error("operation requires a closed indexer")]
    NotClosed,

    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Returns `true` if the error is a lifecycle-misuse error rather than a
    /// pipeline failure. Misuse errors leave the indexer's state untouched.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Closed | Self::AlreadyClosing | Self::NotClosed)
    }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Storage(e.to_string())
    }
}
