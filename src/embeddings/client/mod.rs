#[cfg(test)]
mod tests;

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{EmbeddingItem, EmbeddingService, ServiceError};
use crate::retry::{RetryError, RetryPolicy, retry};
use crate::vector::{EmbeddingVector, VectorCodec};
use crate::{PipelineError, RejectedText, Result};

/// Hard per-request limit assumed when none is configured
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 256;

/// Outcome of embedding a batch where individual texts may be rejected
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EmbeddingBatch {
    /// One slot per input text; `None` where the text was rejected
    pub vectors: Vec<Option<EmbeddingVector>>,
    pub rejections: Vec<RejectedText>,
}

impl EmbeddingBatch {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.rejections.is_empty()
    }

    #[inline]
    pub fn succeeded(&self) -> usize {
        self.vectors.iter().filter(|v| v.is_some()).count()
    }
}

/// Batches texts for the embedding service, retrying transient failures and
/// validating every vector against the configured dimensionality
#[derive(Clone)]
pub struct EmbeddingClient {
    service: Arc<dyn EmbeddingService>,
    codec: VectorCodec,
    policy: RetryPolicy,
    max_request_size: usize,
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("codec", &self.codec)
            .field("policy", &self.policy)
            .field("max_request_size", &self.max_request_size)
            .finish_non_exhaustive()
    }
}

fn describe_failure(error: RetryError<ServiceError>) -> String {
    match error {
        RetryError::Permanent(error) => format!("embedding service refused the request: {error}"),
        RetryError::Exhausted { attempts, last } => {
            format!("embedding service failed after {attempts} attempts: {last}")
        }
    }
}

impl EmbeddingClient {
    #[inline]
    pub fn new(service: Arc<dyn EmbeddingService>, codec: VectorCodec) -> Self {
        Self {
            service,
            codec,
            policy: RetryPolicy::default(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }

    #[inline]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size.max(1);
        self
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.codec.dimensions()
    }

    /// Embed every text or fail. Output has the same length and order as `texts`.
    #[inline]
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        let batch = self.embed_detailed(texts).await?;
        if !batch.is_complete() {
            return Err(PipelineError::EmbeddingRejected {
                reason: format!(
                    "{} of {} texts were rejected",
                    batch.rejections.len(),
                    texts.len()
                ),
                failed: batch.rejections,
            });
        }
        Ok(batch.vectors.into_iter().flatten().collect())
    }

    #[inline]
    pub async fn embed_one(&self, text: &str) -> Result<EmbeddingVector> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| PipelineError::EmbeddingRejected {
            reason: "no vector returned".to_string(),
            failed: vec![RejectedText {
                index: 0,
                reason: "no vector returned".to_string(),
            }],
        })
    }

    /// Embed `texts`, reporting per-text rejections instead of failing the whole batch.
    ///
    /// Still fails outright when a whole request is refused or exhausts its
    /// retries, and on any dimension mismatch.
    #[inline]
    pub async fn embed_detailed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let mut batch = EmbeddingBatch {
            vectors: Vec::with_capacity(texts.len()),
            rejections: Vec::new(),
        };
        if texts.is_empty() {
            return Ok(batch);
        }

        for (chunk_number, chunk) in texts.chunks(self.max_request_size).enumerate() {
            let offset = chunk_number * self.max_request_size;
            debug!(
                "Embedding texts {}..{} of {}",
                offset,
                offset + chunk.len(),
                texts.len()
            );

            let items = retry(&self.policy, "Embedding request", |_| async move {
                let items = self.service.embed(chunk).await?;
                if items.len() == chunk.len() {
                    Ok(items)
                } else {
                    Err(ServiceError::Malformed(format!(
                        "expected {} embeddings, received {}",
                        chunk.len(),
                        items.len()
                    )))
                }
            })
            .await
            .map_err(|error| {
                let reason = describe_failure(error);
                warn!("{}", reason);
                let failed = (offset..offset + chunk.len())
                    .map(|index| RejectedText {
                        index,
                        reason: reason.clone(),
                    })
                    .collect();
                PipelineError::EmbeddingRejected { reason, failed }
            })?;

            for (position, item) in items.into_iter().enumerate() {
                let index = offset + position;
                match item {
                    EmbeddingItem::Vector(values) => match self.codec.validate(index, values) {
                        Ok(vector) => batch.vectors.push(Some(vector)),
                        Err(PipelineError::EmbeddingRejected { failed, .. }) => {
                            batch.vectors.push(None);
                            batch.rejections.extend(failed);
                        }
                        Err(fatal) => return Err(fatal),
                    },
                    EmbeddingItem::Rejected(reason) => {
                        batch.vectors.push(None);
                        batch.rejections.push(RejectedText { index, reason });
                    }
                }
            }
        }

        if !batch.is_complete() {
            warn!(
                "{} of {} texts were rejected by the embedding service",
                batch.rejections.len(),
                texts.len()
            );
        }
        Ok(batch)
    }

    /// Verify the service answers with vectors of the configured dimensionality
    #[inline]
    pub async fn health_check(&self) -> Result<()> {
        debug!("Performing embedding service health check");
        self.embed_one("health check").await?;
        info!(
            "Embedding service health check passed ({} dimensions)",
            self.dimensions()
        );
        Ok(())
    }
}
