// In-process fakes shared by unit tests

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::embeddings::{EmbeddingItem, EmbeddingService, ServiceError};

/// Deterministic bag-of-words vector: each lowercase token adds weight to one bucket
pub(crate) fn bag_of_words(text: &str, dimensions: usize) -> Vec<f32> {
    let mut vector = vec![0.0_f32; dimensions];
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
    {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.to_lowercase().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        let bucket = usize::try_from(hash % dimensions as u64).expect("bucket fits in usize");
        vector[bucket] += 1.0;
    }
    vector
}

pub(crate) fn unavailable() -> ServiceError {
    ServiceError::Unavailable {
        status: 503,
        message: "service overloaded".to_string(),
    }
}

struct RejectRule {
    marker: String,
    remaining: Option<usize>,
}

/// Scriptable embedding service backed by [`bag_of_words`]
pub(crate) struct FakeEmbedder {
    dimensions: usize,
    output_dimensions: usize,
    failures: Mutex<VecDeque<ServiceError>>,
    rejections: Mutex<Vec<RejectRule>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeEmbedder {
    pub(crate) fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            output_dimensions: dimensions,
            failures: Mutex::new(VecDeque::new()),
            rejections: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Return vectors of a different length than requested
    pub(crate) fn with_output_dimensions(mut self, output_dimensions: usize) -> Self {
        self.output_dimensions = output_dimensions;
        self
    }

    /// Fail the next calls with these errors, in order
    pub(crate) fn fail_next(self, errors: impl IntoIterator<Item = ServiceError>) -> Self {
        self.failures
            .lock()
            .expect("failures lock")
            .extend(errors);
        self
    }

    /// Reject every text containing `marker`
    pub(crate) fn reject_containing(self, marker: &str) -> Self {
        self.rejections.lock().expect("rejections lock").push(RejectRule {
            marker: marker.to_string(),
            remaining: None,
        });
        self
    }

    /// Reject texts containing `marker` only the first `times` they are seen
    pub(crate) fn reject_containing_times(self, marker: &str, times: usize) -> Self {
        self.rejections.lock().expect("rejections lock").push(RejectRule {
            marker: marker.to_string(),
            remaining: Some(times),
        });
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    fn rejection_for(&self, text: &str) -> Option<String> {
        let mut rules = self.rejections.lock().expect("rejections lock");
        for rule in rules.iter_mut() {
            if !text.contains(&rule.marker) {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return Some(format!("text contains {}", rule.marker)),
                Some(0) => {}
                Some(remaining) => {
                    *remaining -= 1;
                    return Some(format!("text contains {}", rule.marker));
                }
            }
        }
        None
    }
}

#[async_trait]
impl EmbeddingService for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingItem>, ServiceError> {
        self.calls.lock().expect("calls lock").push(texts.to_vec());

        if let Some(error) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(error);
        }

        Ok(texts
            .iter()
            .map(|text| match self.rejection_for(text) {
                Some(reason) => EmbeddingItem::Rejected(reason),
                None => {
                    let mut vector = bag_of_words(text, self.dimensions);
                    vector.resize(self.output_dimensions, 0.0);
                    EmbeddingItem::Vector(vector)
                }
            })
            .collect())
    }
}
