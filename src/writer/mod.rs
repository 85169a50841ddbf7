// Destination schema management and bulk upserts with per-document outcomes

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::retry::{RetryPolicy, Retryable, retry};
use crate::store::{DestinationIndex, FieldMapping, IndexRequest, IndexState, StoreError};
use crate::vector::{EmbeddingVector, VectorCodec};
use crate::{PipelineError, Result};

const DENSE_VECTOR: &str = "dense_vector";

/// Original fields plus a validated embedding, ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDocument {
    pub id: String,
    pub fields: Map<String, Value>,
    pub embedding: EmbeddingVector,
}

impl EnrichedDocument {
    /// Stored form: the original fields with the vector under `vector_field`
    #[inline]
    pub fn to_source(&self, vector_field: &str, codec: &VectorCodec) -> Map<String, Value> {
        let mut source = self.fields.clone();
        source.insert(vector_field.to_string(), codec.encode(&self.embedding));
        source
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed,
    Failed(String),
}

impl WriteOutcome {
    #[inline]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Writes enriched documents into one destination index
#[derive(Clone)]
pub struct IndexWriter {
    destination: Arc<dyn DestinationIndex>,
    codec: VectorCodec,
    policy: RetryPolicy,
    index: String,
    vector_field: String,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("index", &self.index)
            .field("vector_field", &self.vector_field)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl IndexWriter {
    #[inline]
    pub fn new(
        destination: Arc<dyn DestinationIndex>,
        codec: VectorCodec,
        index: &str,
        vector_field: &str,
    ) -> Self {
        Self {
            destination,
            codec,
            policy: RetryPolicy::default(),
            index: index.to_string(),
            vector_field: vector_field.to_string(),
        }
    }

    #[inline]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// Make sure the destination has a cosine `dense_vector` field of the right size.
    ///
    /// Idempotent. An existing field with another type or size is a conflict,
    /// never silently remapped.
    #[inline]
    pub async fn ensure_schema(&self) -> Result<()> {
        match self.inspect().await? {
            IndexState::Missing => {
                info!(
                    "Destination index {} does not exist, creating it",
                    self.index
                );
                let created = self
                    .destination
                    .create_index(&self.index, &self.vector_field, self.codec.dimensions())
                    .await;
                match created {
                    Ok(()) => Ok(()),
                    Err(StoreError::Status { status: 400, message })
                        if message.contains("resource_already_exists") =>
                    {
                        // created concurrently; whatever won must still match
                        debug!("Index {} appeared while creating it", self.index);
                        self.verify_existing().await
                    }
                    Err(e) => Err(PipelineError::WriteFailed(format!(
                        "creating index {} failed: {e}",
                        self.index
                    ))),
                }
            }
            IndexState::Present { vector_field: None } => {
                info!(
                    "Adding vector field {} to existing index {}",
                    self.vector_field, self.index
                );
                self.destination
                    .add_vector_field(&self.index, &self.vector_field, self.codec.dimensions())
                    .await
                    .map_err(|e| {
                        PipelineError::WriteFailed(format!(
                            "adding field {} to {} failed: {e}",
                            self.vector_field, self.index
                        ))
                    })
            }
            IndexState::Present {
                vector_field: Some(mapping),
            } => self.check_mapping(&mapping),
        }
    }

    /// Upsert `documents` by id, returning one outcome per document in order.
    ///
    /// Only a missing destination index fails the call as a whole; every other
    /// problem is reported per document.
    #[inline]
    pub async fn write_batch(&self, documents: &[EnrichedDocument]) -> Result<Vec<WriteOutcome>> {
        let mut outcomes: Vec<Option<WriteOutcome>> = vec![None; documents.len()];
        let mut pending: Vec<usize> = Vec::with_capacity(documents.len());

        for (position, document) in documents.iter().enumerate() {
            match self.codec.check(&document.embedding) {
                Ok(()) => pending.push(position),
                Err(e) => {
                    warn!("Not writing {}: {}", document.id, e);
                    outcomes[position] = Some(WriteOutcome::Failed(e.to_string()));
                }
            }
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        while !pending.is_empty() {
            let requests: Vec<IndexRequest> = pending
                .iter()
                .map(|&position| IndexRequest {
                    id: documents[position].id.clone(),
                    source: documents[position].to_source(&self.vector_field, &self.codec),
                })
                .collect();
            let last_attempt = attempt >= max_attempts;

            let mut retry_later = Vec::new();
            let mut requested_wait = None;
            match self.destination.bulk_upsert(&self.index, &requests).await {
                Ok(items) => {
                    for (&position, item) in pending.iter().zip(items) {
                        if item.is_success() {
                            outcomes[position] = Some(WriteOutcome::Committed);
                        } else if item.is_retryable() && !last_attempt {
                            retry_later.push(position);
                        } else {
                            let reason = item
                                .error
                                .unwrap_or_else(|| format!("HTTP {}", item.status));
                            outcomes[position] = Some(WriteOutcome::Failed(reason));
                        }
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    return Err(PipelineError::WriteFailed(format!(
                        "destination index {} does not exist",
                        self.index
                    )));
                }
                Err(e) if e.is_retryable() && !last_attempt => {
                    warn!(
                        "Bulk write to {} failed (attempt {}/{}): {}",
                        self.index, attempt, max_attempts, e
                    );
                    requested_wait = e.retry_after();
                    retry_later = pending.clone();
                }
                Err(e) => {
                    warn!("Bulk write to {} failed: {}", self.index, e);
                    let reason = format!("bulk write failed: {e}");
                    for &position in &pending {
                        outcomes[position] = Some(WriteOutcome::Failed(reason.clone()));
                    }
                }
            }

            if !retry_later.is_empty() {
                let mut delay = self.policy.delay_for(attempt);
                if let Some(wait) = requested_wait {
                    delay = delay.max(wait);
                }
                debug!(
                    "Retrying {} documents for {} in {:?}",
                    retry_later.len(),
                    self.index,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            pending = retry_later;
            attempt += 1;
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| WriteOutcome::Failed("not attempted".to_string()))
            })
            .collect())
    }

    /// Make committed writes visible to search
    #[inline]
    pub async fn refresh(&self) -> Result<()> {
        self.destination
            .refresh(&self.index)
            .await
            .map_err(|e| PipelineError::WriteFailed(format!("refreshing {} failed: {e}", self.index)))
    }

    async fn inspect(&self) -> Result<IndexState> {
        retry(&self.policy, "Inspecting destination index", |_| {
            self.destination.inspect(&self.index, &self.vector_field)
        })
        .await
        .map_err(|e| {
            PipelineError::WriteFailed(format!(
                "inspecting {} failed: {}",
                self.index,
                e.into_inner()
            ))
        })
    }

    async fn verify_existing(&self) -> Result<()> {
        match self.inspect().await? {
            IndexState::Present {
                vector_field: Some(mapping),
            } => self.check_mapping(&mapping),
            _ => Err(PipelineError::SchemaConflict(format!(
                "index {} exists without vector field {}",
                self.index, self.vector_field
            ))),
        }
    }

    fn check_mapping(&self, mapping: &FieldMapping) -> Result<()> {
        if mapping.field_type != DENSE_VECTOR {
            return Err(PipelineError::SchemaConflict(format!(
                "field {} in {} has type {}, expected {}",
                self.vector_field, self.index, mapping.field_type, DENSE_VECTOR
            )));
        }
        if mapping.dims != Some(self.codec.dimensions()) {
            return Err(PipelineError::SchemaConflict(format!(
                "field {} in {} has {} dimensions, expected {}",
                self.vector_field,
                self.index,
                mapping
                    .dims
                    .map_or_else(|| "unspecified".to_string(), |d| d.to_string()),
                self.codec.dimensions()
            )));
        }
        debug!(
            "Index {} already maps {} as a {}-dimensional vector",
            self.index,
            self.vector_field,
            self.codec.dimensions()
        );
        Ok(())
    }
}
