// Embedding vector validation and JSON (de)serialization
// Every vector that leaves this module has exactly the configured dimensionality


use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PipelineError, RejectedText, Result};

/// Upper bound accepted for configured dimensionality
pub const MAX_DIMENSIONS: usize = 4096;

/// A validated embedding. Only [`VectorCodec`] constructs these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

/// Cosine similarity in `[-1, 1]`; zero when either side has no magnitude
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot = x.mul_add(*y, dot);
        norm_a = x.mul_add(*x, norm_a);
        norm_b = y.mul_add(*y, norm_b);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Enforces the fixed dimensionality `D` for every vector produced or stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorCodec {
    dimensions: usize,
}

impl VectorCodec {
    #[inline]
    pub fn new(dimensions: usize) -> Result<Self> {
        if dimensions == 0 || dimensions > MAX_DIMENSIONS {
            return Err(PipelineError::Config(format!(
                "embedding dimensions must be between 1 and {MAX_DIMENSIONS}, got {dimensions}"
            )));
        }
        Ok(Self { dimensions })
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Validate raw service output at batch position `index`.
    ///
    /// A length mismatch is a data-integrity failure and is never padded or
    /// truncated. Non-finite components are rejected for that position only.
    #[inline]
    pub fn validate(&self, index: usize, values: Vec<f32>) -> Result<EmbeddingVector> {
        if values.len() != self.dimensions {
            return Err(PipelineError::EmbeddingDimensionMismatch {
                index,
                expected: self.dimensions,
                actual: values.len(),
            });
        }

        if let Some(position) = values.iter().position(|v| !v.is_finite()) {
            return Err(PipelineError::EmbeddingRejected {
                reason: format!("vector component {position} is not a finite number"),
                failed: vec![RejectedText {
                    index,
                    reason: "non-finite vector component".to_string(),
                }],
            });
        }

        Ok(EmbeddingVector(values))
    }

    /// Check an already-built vector before it is written anywhere
    #[inline]
    pub fn check(&self, vector: &EmbeddingVector) -> Result<()> {
        if vector.len() == self.dimensions {
            Ok(())
        } else {
            Err(PipelineError::EmbeddingDimensionMismatch {
                index: 0,
                expected: self.dimensions,
                actual: vector.len(),
            })
        }
    }

    #[inline]
    pub fn encode(&self, vector: &EmbeddingVector) -> Value {
        Value::Array(
            vector
                .0
                .iter()
                .map(|v| serde_json::Number::from_f64(f64::from(*v)).map_or(Value::Null, Value::Number))
                .collect(),
        )
    }

    /// Decode a stored JSON array back into a validated vector
    #[inline]
    pub fn decode(&self, value: &Value) -> Result<EmbeddingVector> {
        let items = value.as_array().ok_or_else(|| {
            PipelineError::SchemaConflict("stored vector is not a JSON array".to_string())
        })?;

        let mut values = Vec::with_capacity(items.len());
        for item in items {
            let number = item.as_f64().ok_or_else(|| {
                PipelineError::SchemaConflict(format!("stored vector has non-numeric item {item}"))
            })?;
            // stored as single precision
            values.push(number as f32);
        }

        self.validate(0, values)
    }
}
