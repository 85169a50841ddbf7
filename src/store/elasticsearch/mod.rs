#[cfg(test)]
mod tests;

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    Cursor, DestinationIndex, DocumentSource, FieldMapping, Hit, IndexRequest, IndexState,
    ItemOutcome, Page, PageRequest, RawDocument, SearchQuery, StoreError,
};
use crate::http::{HttpClient, HttpResponse, Method, RequestBody};

const DEFAULT_KEEP_ALIVE: &str = "5m";
const DEFAULT_SORT_FIELD: &str = "id";
const ERROR_SNIPPET_CHARS: usize = 300;

/// Elasticsearch REST adapter for both the source and destination indices
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    http: HttpClient,
    sort_field: String,
    keep_alive: String,
    point_in_time: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pit_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f32>,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
    #[serde(default)]
    sort: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct PitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DocResponse {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

/// Condense an Elasticsearch error body into `type: reason`
fn error_reason(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(error) = value.get("error") {
            return describe_error(error);
        }
    }
    body.chars().take(ERROR_SNIPPET_CHARS).collect()
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => {
            let kind = fields.get("type").and_then(Value::as_str).unwrap_or("error");
            let reason = fields
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("no reason given");
            format!("{kind}: {reason}")
        }
        other => other.to_string(),
    }
}

fn dense_vector_mapping(dims: usize) -> Value {
    json!({
        "type": "dense_vector",
        "dims": dims,
        "index": true,
        "similarity": "cosine"
    })
}

/// Map a non-2xx response to a `StoreError`, keeping 404 distinct
fn check(response: HttpResponse, resource: &str) -> Result<HttpResponse, StoreError> {
    if response.is_success() {
        return Ok(response);
    }
    if response.status == 404 {
        return Err(StoreError::NotFound(resource.to_string()));
    }
    Err(StoreError::Status {
        status: response.status,
        message: error_reason(&response.body),
    })
}

fn parse<T: for<'de> Deserialize<'de>>(response: &HttpResponse, what: &str) -> Result<T, StoreError> {
    serde_json::from_str(&response.body)
        .map_err(|e| StoreError::Malformed(format!("could not parse {what} response: {e}")))
}

/// Build the `_search` body for kNN, lexical, or hybrid queries
#[inline]
pub fn search_body(query: &SearchQuery) -> Value {
    let knn_clause = query.knn.as_ref().map(|knn| {
        let mut clause = json!({
            "field": knn.field,
            "query_vector": knn.vector,
            "k": knn.k,
            "num_candidates": knn.num_candidates,
        });
        if let Some(boost) = knn.boost {
            clause["boost"] = json!(boost);
        }
        clause
    });

    let lexical_clause = query.lexical.as_ref().map(|lexical| {
        let fields: Vec<String> = lexical
            .fields
            .iter()
            .map(|(field, boost)| format!("{field}^{boost:.1}"))
            .collect();
        json!({
            "multi_match": {
                "query": lexical.text,
                "fields": fields,
                "boost": lexical.boost,
            }
        })
    });

    let mut body = json!({
        "size": query.size,
        "_source": { "excludes": query.exclude_fields },
    });

    match (knn_clause, lexical_clause) {
        (Some(knn), None) => body["knn"] = knn,
        (None, Some(lexical)) => body["query"] = lexical,
        (Some(knn), Some(lexical)) => {
            body["query"] = json!({
                "bool": {
                    "should": [lexical, { "knn": knn }],
                    "minimum_should_match": 1
                }
            });
        }
        (None, None) => body["query"] = json!({ "match_all": {} }),
    }

    body
}

impl ElasticsearchClient {
    #[inline]
    pub fn new(base_url: Url, timeout: Duration, api_key: Option<&str>) -> Self {
        let authorization = api_key
            .filter(|key| !key.trim().is_empty())
            .map(|key| format!("ApiKey {}", key.trim()));

        Self {
            http: HttpClient::new(base_url, timeout, authorization),
            sort_field: DEFAULT_SORT_FIELD.to_string(),
            keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
            point_in_time: true,
        }
    }

    /// Field used as the `search_after` pagination key; must be unique and sortable
    #[inline]
    pub fn with_sort_field(mut self, sort_field: &str) -> Self {
        sort_field.clone_into(&mut self.sort_field);
        self
    }

    #[inline]
    pub fn with_point_in_time(mut self, enabled: bool) -> Self {
        self.point_in_time = enabled;
        self
    }

    #[inline]
    pub fn sort_field(&self) -> &str {
        &self.sort_field
    }

    /// Switch to the `.keyword` sub-field when the sort field is mapped as
    /// `text`, which Elasticsearch refuses to sort on
    #[inline]
    pub async fn resolve_sort_field(&mut self, index: &str) -> Result<(), StoreError> {
        let response = self
            .request(
                Method::Get,
                &[index, "_mapping", "field", &self.sort_field],
                None,
            )
            .await?;
        let response = match check(response, &format!("index [{index}]")) {
            Ok(response) => response,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let body: Value = parse(&response, "field mapping")?;

        let leaf = self
            .sort_field
            .rsplit('.')
            .next()
            .unwrap_or(&self.sort_field);
        let mapping = body
            .as_object()
            .and_then(|indices| indices.values().next())
            .and_then(|entry| entry.get("mappings"))
            .and_then(|fields| fields.get(&self.sort_field))
            .and_then(|field| field.get("mapping"))
            .and_then(|mapping| mapping.get(leaf));
        let Some(mapping) = mapping else {
            warn!(
                "Sort field {} is not mapped in {}; pages may come back unsorted",
                self.sort_field, index
            );
            return Ok(());
        };

        if mapping.get("type").and_then(Value::as_str) == Some("text") {
            let keyword = mapping
                .get("fields")
                .and_then(|fields| fields.get("keyword"))
                .and_then(|keyword| keyword.get("type"))
                .and_then(Value::as_str);
            if keyword == Some("keyword") {
                let resolved = format!("{}.keyword", self.sort_field);
                warn!(
                    "Sort field {} in {} is text, paging on {} instead",
                    self.sort_field, index, resolved
                );
                self.sort_field = resolved;
            } else {
                warn!(
                    "Sort field {} in {} is text without a keyword sub-field; set source.sort_field to a keyword or numeric field",
                    self.sort_field, index
                );
            }
        }
        Ok(())
    }

    /// Check that the cluster answers at all
    #[inline]
    pub async fn ping(&self) -> Result<(), StoreError> {
        let response = self
            .http
            .send(Method::Get, self.http.base_url().clone(), None)
            .await?;
        check(response, "cluster")?;
        info!("Connected to Elasticsearch at {}", self.http.base_url());
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<RequestBody>,
    ) -> Result<HttpResponse, StoreError> {
        let url = self.http.url(segments)?;
        Ok(self.http.send(method, url, body).await?)
    }
}

#[async_trait]
impl DocumentSource for ElasticsearchClient {
    async fn open_snapshot(&self, index: &str) -> Result<Option<String>, StoreError> {
        if !self.point_in_time {
            return Ok(None);
        }

        let mut url = self.http.url(&[index, "_pit"])?;
        url.query_pairs_mut()
            .append_pair("keep_alive", &self.keep_alive);
        let response = self.http.send(Method::Post, url, None).await?;
        let response = check(response, &format!("index [{index}]"))?;
        let pit: PitResponse = parse(&response, "point-in-time")?;
        debug!("Opened point-in-time snapshot for {}", index);
        Ok(Some(pit.id))
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> Result<Page, StoreError> {
        let mut sort_clause = Map::new();
        sort_clause.insert(self.sort_field.clone(), json!("asc"));

        let mut body = json!({
            "size": request.size,
            "sort": [Value::Object(sort_clause)],
            "query": { "match_all": {} },
        });
        if let Some(after) = request.after {
            body["search_after"] = Value::Array(after.values().to_vec());
        }

        let response = if let Some(pit) = request.snapshot {
            body["pit"] = json!({ "id": pit, "keep_alive": self.keep_alive });
            self.request(Method::Post, &["_search"], Some(RequestBody::json(&body)))
                .await?
        } else {
            self.request(
                Method::Post,
                &[request.index, "_search"],
                Some(RequestBody::json(&body)),
            )
            .await?
        };

        let response = check(response, &format!("index [{}]", request.index))?;
        let parsed: SearchResponse = parse(&response, "search")?;

        let mut documents = Vec::with_capacity(parsed.hits.hits.len());
        for hit in parsed.hits.hits {
            if hit.sort.is_empty() {
                return Err(StoreError::Malformed(format!(
                    "hit {} carries no sort values",
                    hit.id
                )));
            }
            documents.push(RawDocument {
                id: hit.id,
                fields: hit.source,
                sort: Cursor::new(hit.sort),
            });
        }

        Ok(Page {
            documents,
            snapshot: parsed.pit_id.or_else(|| request.snapshot.map(str::to_string)),
        })
    }

    async fn close_snapshot(&self, snapshot: &str) -> Result<(), StoreError> {
        let response = self
            .request(
                Method::Delete,
                &["_pit"],
                Some(RequestBody::json(&json!({ "id": snapshot }))),
            )
            .await?;
        match check(response, "point-in-time") {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DestinationIndex for ElasticsearchClient {
    async fn inspect(&self, index: &str, vector_field: &str) -> Result<IndexState, StoreError> {
        let response = self.request(Method::Get, &[index, "_mapping"], None).await?;
        let response = match check(response, &format!("index [{index}]")) {
            Ok(response) => response,
            Err(StoreError::NotFound(_)) => return Ok(IndexState::Missing),
            Err(e) => return Err(e),
        };

        let mappings: Map<String, Value> = parse(&response, "mapping")?;
        // An alias resolves to its concrete index name, so take the first entry
        let properties = mappings
            .values()
            .next()
            .and_then(|entry| entry.pointer("/mappings/properties"))
            .and_then(Value::as_object);

        let vector_field = properties
            .and_then(|props| props.get(vector_field))
            .map(|field| FieldMapping {
                field_type: field
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("object")
                    .to_string(),
                dims: field
                    .get("dims")
                    .and_then(Value::as_u64)
                    .and_then(|d| usize::try_from(d).ok()),
            });

        Ok(IndexState::Present { vector_field })
    }

    async fn create_index(
        &self,
        index: &str,
        vector_field: &str,
        dims: usize,
    ) -> Result<(), StoreError> {
        let mut properties = Map::new();
        properties.insert(vector_field.to_string(), dense_vector_mapping(dims));
        let body = json!({ "mappings": { "properties": properties } });

        let response = self
            .request(Method::Put, &[index], Some(RequestBody::json(&body)))
            .await?;
        check(response, &format!("index [{index}]"))?;
        info!(
            "Created index {} with {}-dimensional vector field {}",
            index, dims, vector_field
        );
        Ok(())
    }

    async fn add_vector_field(
        &self,
        index: &str,
        vector_field: &str,
        dims: usize,
    ) -> Result<(), StoreError> {
        let mut properties = Map::new();
        properties.insert(vector_field.to_string(), dense_vector_mapping(dims));
        let body = json!({ "properties": properties });

        let response = self
            .request(
                Method::Put,
                &[index, "_mapping"],
                Some(RequestBody::json(&body)),
            )
            .await?;
        check(response, &format!("index [{index}]"))?;
        info!("Added vector field {} to index {}", vector_field, index);
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        documents: &[IndexRequest],
    ) -> Result<Vec<ItemOutcome>, StoreError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut payload = String::new();
        for document in documents {
            let action = json!({ "index": { "_index": index, "_id": document.id } });
            // writing into a String cannot fail
            let _ = writeln!(payload, "{action}");
            let _ = writeln!(payload, "{}", Value::Object(document.source.clone()));
        }

        let response = self
            .request(Method::Post, &["_bulk"], Some(RequestBody::ndjson(payload)))
            .await?;
        let response = check(response, &format!("index [{index}]"))?;
        let parsed: BulkResponse = parse(&response, "bulk")?;

        if parsed.items.len() != documents.len() {
            return Err(StoreError::Malformed(format!(
                "bulk response has {} items for {} documents",
                parsed.items.len(),
                documents.len()
            )));
        }

        let mut outcomes = Vec::with_capacity(documents.len());
        for (document, item) in documents.iter().zip(parsed.items) {
            let Some(result) = item.into_iter().next().map(|(_, v)| v) else {
                return Err(StoreError::Malformed("empty bulk item".to_string()));
            };
            let result: BulkItem = serde_json::from_value(result)
                .map_err(|e| StoreError::Malformed(format!("could not parse bulk item: {e}")))?;

            if let Some(id) = result.id.as_deref() {
                if id != document.id {
                    warn!("Bulk item id {} does not match request id {}", id, document.id);
                }
            }

            outcomes.push(ItemOutcome {
                id: document.id.clone(),
                status: result.status,
                error: result.error.as_ref().map(describe_error),
            });
        }

        Ok(outcomes)
    }

    async fn search(&self, index: &str, query: &SearchQuery) -> Result<Vec<Hit>, StoreError> {
        let body = search_body(query);
        let response = self
            .request(
                Method::Post,
                &[index, "_search"],
                Some(RequestBody::json(&body)),
            )
            .await?;
        let response = check(response, &format!("index [{index}]"))?;
        let parsed: SearchResponse = parse(&response, "search")?;

        Ok(parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| Hit {
                id: hit.id,
                score: hit.score.unwrap_or_default(),
                source: hit.source,
            })
            .collect())
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<Map<String, Value>>, StoreError> {
        let response = self.request(Method::Get, &[index, "_doc", id], None).await?;
        if response.status == 404 {
            // 404 covers both a missing document and a missing index
            let names_document = serde_json::from_str::<Value>(&response.body)
                .is_ok_and(|body| body.get("found").is_some());
            return if names_document {
                Ok(None)
            } else {
                Err(StoreError::NotFound(format!("index [{index}]")))
            };
        }
        let response = check(response, &format!("document [{id}]"))?;
        let parsed: DocResponse = parse(&response, "get")?;
        Ok(parsed.found.then_some(parsed.source))
    }

    async fn count(&self, index: &str) -> Result<u64, StoreError> {
        let response = self.request(Method::Get, &[index, "_count"], None).await?;
        let response = check(response, &format!("index [{index}]"))?;
        let parsed: CountResponse = parse(&response, "count")?;
        Ok(parsed.count)
    }

    async fn refresh(&self, index: &str) -> Result<(), StoreError> {
        let response = self.request(Method::Post, &[index, "_refresh"], None).await?;
        check(response, &format!("index [{index}]"))?;
        Ok(())
    }
}
