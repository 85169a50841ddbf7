use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A single text the embedding service refused, by position in the submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedText {
    pub index: usize,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source index unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Embedding rejected: {reason}")]
    EmbeddingRejected {
        reason: String,
        failed: Vec<RejectedText>,
    },

    #[error("Embedding dimension mismatch at position {index}: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Schema conflict: {0}")]
    SchemaConflict(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Data-integrity and schema errors stop the current unit of work outright
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingDimensionMismatch { .. } | Self::SchemaConflict(_) | Self::Config(_)
        )
    }
}

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod embeddings;
pub mod http;
pub mod pipeline;
pub mod retry;
pub mod search;
pub mod source;
pub mod store;
pub mod vector;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;
