// Narrow interfaces to the source and destination document stores
// Elasticsearch speaks these over REST; the in-memory store backs local runs and tests

pub mod elasticsearch;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::http::HttpError;
use crate::retry::Retryable;

pub use elasticsearch::ElasticsearchClient;
pub use memory::MemoryStore;

/// Opaque pagination position: the sort values of the last document read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Vec<Value>);

impl Cursor {
    #[inline]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

/// A document as returned by the source store, before text derivation
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub fields: Map<String, Value>,
    pub sort: Cursor,
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    pub index: &'a str,
    pub snapshot: Option<&'a str>,
    pub after: Option<&'a Cursor>,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub documents: Vec<RawDocument>,
    /// Snapshot handle to use for the next page; stores may rotate it
    pub snapshot: Option<String>,
}

/// Mapping of one field in the destination index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub field_type: String,
    pub dims: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    Missing,
    Present { vector_field: Option<FieldMapping> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRequest {
    pub id: String,
    pub source: Map<String, Value>,
}

/// Per-document result of a bulk request, in request order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub status: u16,
    pub error: Option<String>,
}

impl ItemOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Throttled or server-side item failures are worth another attempt
    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnnQuery {
    pub field: String,
    pub vector: Vec<f32>,
    pub k: usize,
    pub num_candidates: usize,
    pub boost: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexicalQuery {
    pub text: String,
    pub fields: Vec<(String, f32)>,
    pub boost: f32,
}

/// kNN, lexical, or both (hybrid, scores summed)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchQuery {
    pub knn: Option<KnnQuery>,
    pub lexical: Option<LexicalQuery>,
    pub size: usize,
    pub exclude_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    pub score: f32,
    pub source: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(#[from] HttpError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(error) => error.is_transient(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound(_) | Self::Malformed(_) => false,
        }
    }
}

/// Paginated read access to the source index
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Pin a consistent view of `index`; `None` when the store has no snapshot support
    async fn open_snapshot(&self, index: &str) -> Result<Option<String>, StoreError>;

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Page, StoreError>;

    async fn close_snapshot(&self, snapshot: &str) -> Result<(), StoreError>;
}

/// Schema, bulk-write, and query access to the destination index
#[async_trait]
pub trait DestinationIndex: Send + Sync {
    async fn inspect(&self, index: &str, vector_field: &str) -> Result<IndexState, StoreError>;

    async fn create_index(
        &self,
        index: &str,
        vector_field: &str,
        dims: usize,
    ) -> Result<(), StoreError>;

    async fn add_vector_field(
        &self,
        index: &str,
        vector_field: &str,
        dims: usize,
    ) -> Result<(), StoreError>;

    /// Insert or overwrite every document by id; one outcome per request, same order
    async fn bulk_upsert(
        &self,
        index: &str,
        documents: &[IndexRequest],
    ) -> Result<Vec<ItemOutcome>, StoreError>;

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>, StoreError>;

    async fn get(&self, index: &str, id: &str) -> Result<Option<Map<String, Value>>, StoreError>;

    async fn count(&self, index: &str) -> Result<u64, StoreError>;

    /// Make recent writes visible to search
    async fn refresh(&self, _index: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
