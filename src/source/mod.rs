// Lazy, restartable reading of source documents over search_after pagination


use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::retry::{RetryError, RetryPolicy, retry};
use crate::store::{Cursor, DocumentSource, PageRequest, RawDocument, StoreError};
use crate::{PipelineError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// A source document plus the text to embed and its resume position
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    pub fields: Map<String, Value>,
    pub text: String,
    /// Position immediately after this document
    pub cursor: Cursor,
}

/// Builds embedding text by joining configured fields with single spaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextExtractor {
    fields: Vec<String>,
}

impl Default for TextExtractor {
    #[inline]
    fn default() -> Self {
        Self::new(vec!["name".to_string(), "description".to_string()])
    }
}

impl TextExtractor {
    #[inline]
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// Missing, null, and blank fields are skipped; non-strings render as compact JSON
    #[inline]
    pub fn extract(&self, document: &Map<String, Value>) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            match document.get(field) {
                None | Some(Value::Null) => {}
                Some(Value::String(text)) => {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        parts.push(trimmed.to_string());
                    }
                }
                Some(other) => parts.push(other.to_string()),
            }
        }
        parts.join(" ")
    }
}

/// Opens document streams over a source index
#[derive(Clone)]
pub struct SourceReader {
    source: Arc<dyn DocumentSource>,
    policy: RetryPolicy,
    page_size: usize,
    extractor: TextExtractor,
    use_snapshot: bool,
}

impl std::fmt::Debug for SourceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceReader")
            .field("page_size", &self.page_size)
            .field("extractor", &self.extractor)
            .field("use_snapshot", &self.use_snapshot)
            .finish_non_exhaustive()
    }
}

fn unavailable(index: &str, error: RetryError<StoreError>) -> PipelineError {
    match error {
        RetryError::Permanent(StoreError::NotFound(_)) => {
            PipelineError::SourceUnavailable(format!("source index {index} does not exist"))
        }
        RetryError::Permanent(error) => {
            PipelineError::SourceUnavailable(format!("reading {index} failed: {error}"))
        }
        RetryError::Exhausted { attempts, last } => PipelineError::SourceUnavailable(format!(
            "reading {index} failed after {attempts} attempts: {last}"
        )),
    }
}

impl SourceReader {
    #[inline]
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self {
            source,
            policy: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
            extractor: TextExtractor::default(),
            use_snapshot: true,
        }
    }

    #[inline]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[inline]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[inline]
    pub fn with_text_fields(mut self, fields: Vec<String>) -> Self {
        self.extractor = TextExtractor::new(fields);
        self
    }

    /// Pin reads to a point-in-time snapshot when the store supports one
    #[inline]
    pub fn with_snapshot(mut self, enabled: bool) -> Self {
        self.use_snapshot = enabled;
        self
    }

    #[inline]
    pub async fn open(&self, index: &str) -> Result<DocumentStream> {
        self.open_from(index, None).await
    }

    /// Open a stream that starts strictly after `after`
    #[inline]
    pub async fn open_from(&self, index: &str, after: Option<Cursor>) -> Result<DocumentStream> {
        let snapshot = if self.use_snapshot {
            retry(&self.policy, "Opening source snapshot", |_| {
                self.source.open_snapshot(index)
            })
            .await
            .map_err(|e| unavailable(index, e))?
        } else {
            None
        };

        match &after {
            Some(cursor) => info!("Reading {} from cursor {:?}", index, cursor.values()),
            None => info!("Reading {} from the beginning", index),
        }

        Ok(DocumentStream {
            source: Arc::clone(&self.source),
            policy: self.policy.clone(),
            extractor: self.extractor.clone(),
            index: index.to_string(),
            page_size: self.page_size,
            snapshot,
            fetch_after: after.clone(),
            position: after,
            buffer: VecDeque::new(),
            exhausted: false,
        })
    }
}

/// Forward-only iterator over source documents; ends with `None` or an empty batch
pub struct DocumentStream {
    source: Arc<dyn DocumentSource>,
    policy: RetryPolicy,
    extractor: TextExtractor,
    index: String,
    page_size: usize,
    snapshot: Option<String>,
    fetch_after: Option<Cursor>,
    position: Option<Cursor>,
    buffer: VecDeque<SourceDocument>,
    exhausted: bool,
}

impl std::fmt::Debug for DocumentStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStream")
            .field("index", &self.index)
            .field("position", &self.position)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

impl DocumentStream {
    /// Cursor just past the last document handed out, or the start position
    #[inline]
    pub fn position(&self) -> Option<&Cursor> {
        self.position.as_ref()
    }

    #[inline]
    pub async fn next(&mut self) -> Result<Option<SourceDocument>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        let document = self.buffer.pop_front();
        if let Some(document) = &document {
            self.position = Some(document.cursor.clone());
        }
        Ok(document)
    }

    /// Up to `max` documents; an empty batch means the source is exhausted
    #[inline]
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<SourceDocument>> {
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            match self.next().await? {
                Some(document) => batch.push(document),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Release the snapshot held by this stream
    #[inline]
    pub async fn close(mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            self.source
                .close_snapshot(&snapshot)
                .await
                .map_err(|e| {
                    warn!("Failed to release snapshot for {}: {}", self.index, e);
                    PipelineError::SourceUnavailable(format!(
                        "closing snapshot of {} failed: {e}",
                        self.index
                    ))
                })?;
            debug!("Released snapshot for {}", self.index);
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        let page = retry(&self.policy, "Source page fetch", |_| {
            self.source.fetch_page(PageRequest {
                index: &self.index,
                snapshot: self.snapshot.as_deref(),
                after: self.fetch_after.as_ref(),
                size: self.page_size,
            })
        })
        .await
        .map_err(|e| unavailable(&self.index, e))?;

        if page.snapshot.is_some() {
            self.snapshot = page.snapshot;
        }
        if page.documents.len() < self.page_size {
            self.exhausted = true;
        }

        debug!(
            "Fetched {} documents from {}",
            page.documents.len(),
            self.index
        );

        for RawDocument { id, fields, sort } in page.documents {
            let text = self.extractor.extract(&fields);
            self.fetch_after = Some(sort.clone());
            self.buffer.push_back(SourceDocument {
                id,
                fields,
                text,
                cursor: sort,
            });
        }

        Ok(())
    }
}
