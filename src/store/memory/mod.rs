// In-process document store implementing both store interfaces
// Documents are ordered by id, which doubles as the pagination key


use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    Cursor, DestinationIndex, DocumentSource, FieldMapping, Hit, IndexRequest, IndexState,
    ItemOutcome, KnnQuery, LexicalQuery, Page, PageRequest, SearchQuery, StoreError,
};
use crate::http::HttpError;
use crate::vector::cosine_similarity;

const DENSE_VECTOR: &str = "dense_vector";

#[derive(Debug, Default)]
struct MemoryIndex {
    mappings: HashMap<String, FieldMapping>,
    documents: BTreeMap<String, Map<String, Value>>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_fetches: u32,
    failing_bulk_calls: u32,
    write_rejections: HashMap<String, (u16, String, u32)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    indices: RwLock<HashMap<String, MemoryIndex>>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index without any field mappings
    #[inline]
    pub fn create_plain_index(&self, index: &str) {
        self.indices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(index.to_string())
            .or_default();
    }

    #[inline]
    pub fn set_field_mapping(&self, index: &str, field: &str, mapping: FieldMapping) {
        self.indices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(index.to_string())
            .or_default()
            .mappings
            .insert(field.to_string(), mapping);
    }

    /// Insert or replace a document, creating the index if needed
    #[inline]
    pub fn insert_document(&self, index: &str, id: &str, fields: Map<String, Value>) {
        self.indices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(index.to_string())
            .or_default()
            .documents
            .insert(id.to_string(), fields);
    }

    /// All documents of `index` in id order
    #[inline]
    pub fn documents(&self, index: &str) -> Vec<(String, Map<String, Value>)> {
        self.indices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .map(|idx| {
                idx.documents
                    .iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    #[inline]
    pub fn field_mapping(&self, index: &str, field: &str) -> Option<FieldMapping> {
        self.indices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .and_then(|idx| idx.mappings.get(field).cloned())
    }

    /// The next `count` page fetches fail with a connection error
    #[inline]
    pub fn fail_next_fetches(&self, count: u32) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_fetches = count;
    }

    /// The next `count` bulk calls fail with a connection error
    #[inline]
    pub fn fail_next_bulk_calls(&self, count: u32) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_bulk_calls = count;
    }

    /// Writes of document `id` fail with `status` for the next `times` attempts
    #[inline]
    pub fn reject_writes(&self, id: &str, status: u16, reason: &str, times: u32) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_rejections
            .insert(id.to_string(), (status, reason.to_string(), times));
    }

    fn take_fault(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn take_write_rejection(&self, id: &str) -> Option<(u16, String)> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = faults.write_rejections.get_mut(id)?;
        if entry.2 == 0 {
            return None;
        }
        entry.2 -= 1;
        Some((entry.0, entry.1.clone()))
    }
}

fn simulated_outage(operation: &str) -> StoreError {
    StoreError::Transport(HttpError::Connection(format!(
        "simulated outage during {operation}"
    )))
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn field_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn knn_scores(index: &MemoryIndex, knn: &KnnQuery) -> Result<Vec<(String, f32)>, StoreError> {
    let is_vector_field = index
        .mappings
        .get(&knn.field)
        .is_some_and(|m| m.field_type == DENSE_VECTOR);
    if !is_vector_field {
        return Err(StoreError::Status {
            status: 400,
            message: format!(
                "[knn] queries are only supported on [dense_vector] fields, [{}] is not one",
                knn.field
            ),
        });
    }

    let mut scored: Vec<(String, f32)> = index
        .documents
        .iter()
        .filter_map(|(id, doc)| {
            let stored: Vec<f32> = doc
                .get(&knn.field)?
                .as_array()?
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect();
            if stored.len() != knn.vector.len() {
                return None;
            }
            let similarity = cosine_similarity(&stored, &knn.vector);
            let score = f32::midpoint(1.0, similarity) * knn.boost.unwrap_or(1.0);
            Some((id.clone(), score))
        })
        .collect();

    sort_scored(&mut scored);
    scored.truncate(knn.k);
    Ok(scored)
}

fn lexical_scores(index: &MemoryIndex, lexical: &LexicalQuery) -> Vec<(String, f32)> {
    let query_tokens = tokens(&lexical.text);
    let mut scored: Vec<(String, f32)> = index
        .documents
        .iter()
        .filter_map(|(id, doc)| {
            let score: f32 = lexical
                .fields
                .iter()
                .map(|(field, boost)| {
                    let field_tokens = tokens(&field_text(doc.get(field)));
                    let matches = query_tokens
                        .iter()
                        .filter(|t| field_tokens.contains(t))
                        .count();
                    boost * matches as f32
                })
                .sum();
            (score > 0.0).then(|| (id.clone(), score * lexical.boost))
        })
        .collect();
    sort_scored(&mut scored);
    scored
}

fn sort_scored(scored: &mut [(String, f32)]) {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

#[async_trait]
impl DocumentSource for MemoryStore {
    async fn open_snapshot(&self, index: &str) -> Result<Option<String>, StoreError> {
        if self
            .indices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(index)
        {
            Ok(None)
        } else {
            Err(StoreError::NotFound(format!("index [{index}]")))
        }
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Page, StoreError> {
        {
            let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            if Self::take_fault(&mut faults.failing_fetches) {
                return Err(simulated_outage("page fetch"));
            }
        }

        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let index = indices
            .get(request.index)
            .ok_or_else(|| StoreError::NotFound(format!("index [{}]", request.index)))?;

        let lower = match request.after {
            Some(cursor) => {
                let after = cursor
                    .values()
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::Malformed("cursor is not an id".to_string()))?;
                Bound::Excluded(after.to_string())
            }
            None => Bound::Unbounded,
        };

        let documents: Vec<_> = index
            .documents
            .range((lower, Bound::Unbounded))
            .take(request.size)
            .map(|(id, fields)| super::RawDocument {
                id: id.clone(),
                fields: fields.clone(),
                sort: Cursor::new(vec![Value::String(id.clone())]),
            })
            .collect();

        debug!(
            "Memory store served {} documents from {}",
            documents.len(),
            request.index
        );
        Ok(Page {
            documents,
            snapshot: None,
        })
    }

    async fn close_snapshot(&self, _snapshot: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl DestinationIndex for MemoryStore {
    async fn inspect(&self, index: &str, vector_field: &str) -> Result<IndexState, StoreError> {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        Ok(match indices.get(index) {
            None => IndexState::Missing,
            Some(idx) => IndexState::Present {
                vector_field: idx.mappings.get(vector_field).cloned(),
            },
        })
    }

    async fn create_index(
        &self,
        index: &str,
        vector_field: &str,
        dims: usize,
    ) -> Result<(), StoreError> {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        if indices.contains_key(index) {
            return Err(StoreError::Status {
                status: 400,
                message: format!("resource_already_exists_exception: index [{index}]"),
            });
        }
        let mut created = MemoryIndex::default();
        created.mappings.insert(
            vector_field.to_string(),
            FieldMapping {
                field_type: DENSE_VECTOR.to_string(),
                dims: Some(dims),
            },
        );
        indices.insert(index.to_string(), created);
        Ok(())
    }

    async fn add_vector_field(
        &self,
        index: &str,
        vector_field: &str,
        dims: usize,
    ) -> Result<(), StoreError> {
        let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
        let idx = indices
            .get_mut(index)
            .ok_or_else(|| StoreError::NotFound(format!("index [{index}]")))?;
        idx.mappings.insert(
            vector_field.to_string(),
            FieldMapping {
                field_type: DENSE_VECTOR.to_string(),
                dims: Some(dims),
            },
        );
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        documents: &[IndexRequest],
    ) -> Result<Vec<ItemOutcome>, StoreError> {
        {
            let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
            if Self::take_fault(&mut faults.failing_bulk_calls) {
                return Err(simulated_outage("bulk write"));
            }
        }

        let mut outcomes = Vec::with_capacity(documents.len());
        for request in documents {
            if let Some((status, reason)) = self.take_write_rejection(&request.id) {
                outcomes.push(ItemOutcome {
                    id: request.id.clone(),
                    status,
                    error: Some(reason),
                });
                continue;
            }

            let mut indices = self.indices.write().unwrap_or_else(PoisonError::into_inner);
            let idx = indices
                .get_mut(index)
                .ok_or_else(|| StoreError::NotFound(format!("index [{index}]")))?;

            let dims_error = idx.mappings.iter().find_map(|(field, mapping)| {
                let expected = mapping.dims?;
                let actual = request.source.get(field)?.as_array()?.len();
                (actual != expected).then(|| {
                    format!(
                        "mapper_parsing_exception: field [{field}] has {actual} dimensions, expected {expected}"
                    )
                })
            });

            if let Some(error) = dims_error {
                outcomes.push(ItemOutcome {
                    id: request.id.clone(),
                    status: 400,
                    error: Some(error),
                });
            } else {
                let created = idx
                    .documents
                    .insert(request.id.clone(), request.source.clone())
                    .is_none();
                outcomes.push(ItemOutcome {
                    id: request.id.clone(),
                    status: if created { 201 } else { 200 },
                    error: None,
                });
            }
        }

        Ok(outcomes)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let idx = indices
            .get(index)
            .ok_or_else(|| StoreError::NotFound(format!("index [{index}]")))?;

        let mut combined: HashMap<String, f32> = HashMap::new();
        if let Some(knn) = &query.knn {
            for (id, score) in knn_scores(idx, knn)? {
                *combined.entry(id).or_default() += score;
            }
        }
        if let Some(lexical) = &query.lexical {
            for (id, score) in lexical_scores(idx, lexical) {
                *combined.entry(id).or_default() += score;
            }
        }

        let mut scored: Vec<(String, f32)> = combined.into_iter().collect();
        sort_scored(&mut scored);
        scored.truncate(query.size);

        Ok(scored
            .into_iter()
            .filter_map(|(id, score)| {
                let mut source = idx.documents.get(&id)?.clone();
                for excluded in &query.exclude_fields {
                    source.remove(excluded);
                }
                Some(Hit { id, score, source })
            })
            .collect())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Map<String, Value>>, StoreError> {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let idx = indices
            .get(index)
            .ok_or_else(|| StoreError::NotFound(format!("index [{index}]")))?;
        Ok(idx.documents.get(id).cloned())
    }

    async fn count(&self, index: &str) -> Result<u64, StoreError> {
        let indices = self.indices.read().unwrap_or_else(PoisonError::into_inner);
        let idx = indices
            .get(index)
            .ok_or_else(|| StoreError::NotFound(format!("index [{index}]")))?;
        Ok(idx.documents.len() as u64)
    }
}
