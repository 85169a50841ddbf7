// Embedding service abstraction and the batching client built on top of it

pub mod client;
pub mod service;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::http::HttpError;
use crate::retry::Retryable;

pub use client::{EmbeddingBatch, EmbeddingClient};
pub use service::GenAiService;

/// Per-text result of one service call, in request order
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingItem {
    Vector(Vec<f32>),
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("rate limited by embedding service: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("embedding service unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },
    #[error("embedding service transport error: {0}")]
    Transport(#[from] HttpError),
    #[error("embedding request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

impl Retryable for ServiceError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Unavailable { .. } => true,
            Self::Transport(error) => error.is_transient(),
            Self::Rejected { .. } | Self::Malformed(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Synchronous "texts to vectors" contract of the external embedding model
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// One item per input text, same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingItem>, ServiceError>;
}
