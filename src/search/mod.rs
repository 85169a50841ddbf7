// Query-term search against the enriched index: semantic, lexical, or hybrid


use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::embeddings::EmbeddingClient;
use crate::store::{
    DestinationIndex, Hit, IndexState, KnnQuery, LexicalQuery, SearchQuery, StoreError,
};
use crate::{PipelineError, Result};

const DENSE_VECTOR: &str = "dense_vector";
const LEXICAL_BOOST: f32 = 2.5;
const HYBRID_KNN_BOOST: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Semantic,
    Lexical,
    Hybrid,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Semantic => "semantic",
            Self::Lexical => "lexical",
            Self::Hybrid => "hybrid",
        })
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "semantic" | "knn" => Ok(Self::Semantic),
            "lexical" | "text" => Ok(Self::Lexical),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!(
                "unknown search mode '{other}', expected semantic, lexical, or hybrid"
            )),
        }
    }
}

impl SearchMode {
    /// Every mode, in the order a side-by-side comparison runs them
    pub const ALL: [Self; 3] = [Self::Semantic, Self::Hybrid, Self::Lexical];
}

/// A comma-separated list of modes, or `all` for every mode
#[inline]
pub fn parse_modes(value: &str) -> std::result::Result<Vec<SearchMode>, String> {
    if value.trim().eq_ignore_ascii_case("all") {
        return Ok(SearchMode::ALL.to_vec());
    }
    let mut modes = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let mode: SearchMode = part.parse()?;
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }
    if modes.is_empty() {
        return Err("expected at least one search mode".to_string());
    }
    Ok(modes)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub score: f32,
    pub fields: Map<String, Value>,
}

/// Results for one term; a failed term does not affect the others
#[derive(Debug)]
pub struct TermResults {
    pub term: String,
    pub mode: SearchMode,
    pub elapsed: Duration,
    pub outcome: Result<Vec<SearchResult>>,
}

/// Serializable form of [`TermResults`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermReport {
    pub term: String,
    pub mode: SearchMode,
    pub elapsed_ms: f64,
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&TermResults> for TermReport {
    #[inline]
    fn from(term: &TermResults) -> Self {
        let (results, error) = match &term.outcome {
            Ok(results) => (results.clone(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        Self {
            term: term.term.clone(),
            mode: term.mode,
            elapsed_ms: term.elapsed.as_secs_f64() * 1000.0,
            results,
            error,
        }
    }
}

/// Aggregate of one mode across every term it ran for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeSummary {
    pub mode: SearchMode,
    pub terms: usize,
    pub failed: usize,
    pub mean_elapsed_ms: f64,
    pub mean_results: f64,
}

/// Per-mode totals, in the order modes first appear in `results`
#[inline]
pub fn summarize(results: &[TermResults]) -> Vec<ModeSummary> {
    let mut modes: Vec<SearchMode> = Vec::new();
    for term in results {
        if !modes.contains(&term.mode) {
            modes.push(term.mode);
        }
    }

    modes
        .into_iter()
        .map(|mode| {
            let runs: Vec<&TermResults> = results.iter().filter(|t| t.mode == mode).collect();
            let count = runs.len() as f64;
            let elapsed: f64 = runs.iter().map(|t| t.elapsed.as_secs_f64() * 1000.0).sum();
            let found: usize = runs
                .iter()
                .filter_map(|t| t.outcome.as_ref().ok())
                .map(Vec::len)
                .sum();
            ModeSummary {
                mode,
                terms: runs.len(),
                failed: runs.iter().filter(|t| t.outcome.is_err()).count(),
                mean_elapsed_ms: elapsed / count,
                mean_results: found as f64 / count,
            }
        })
        .collect()
}

/// Score descending, ties broken by document id ascending
#[inline]
pub fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.document_id.cmp(&b.document_id))
    });
}

/// One term per line; blank lines dropped, whitespace trimmed, duplicates kept
#[inline]
pub fn parse_search_terms(content: &str) -> Vec<String> {
    content
        .trim_start_matches('\u{feff}')
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[inline]
pub async fn read_search_terms(path: &Path) -> Result<Vec<String>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::Config(format!(
                "search terms file {} not found",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let terms = parse_search_terms(&content);
    info!("Read {} search terms from {}", terms.len(), path.display());
    Ok(terms)
}

fn query_failed(index: &str, error: &StoreError) -> PipelineError {
    match error {
        StoreError::NotFound(_) => {
            PipelineError::QueryFailed(format!("index {index} does not exist"))
        }
        other => PipelineError::QueryFailed(format!("searching {index} failed: {other}")),
    }
}

/// Runs search terms against the destination index
#[derive(Clone)]
pub struct SearchEngine {
    destination: Arc<dyn DestinationIndex>,
    embedder: EmbeddingClient,
    index: String,
    vector_field: String,
    mode: SearchMode,
    num_candidates_factor: usize,
    lexical_fields: Vec<(String, f32)>,
}

impl fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchEngine")
            .field("index", &self.index)
            .field("vector_field", &self.vector_field)
            .field("mode", &self.mode)
            .field("num_candidates_factor", &self.num_candidates_factor)
            .finish_non_exhaustive()
    }
}

impl SearchEngine {
    #[inline]
    pub fn new(
        destination: Arc<dyn DestinationIndex>,
        embedder: EmbeddingClient,
        index: &str,
        vector_field: &str,
    ) -> Self {
        Self {
            destination,
            embedder,
            index: index.to_string(),
            vector_field: vector_field.to_string(),
            mode: SearchMode::Semantic,
            num_candidates_factor: 10,
            lexical_fields: vec![("name".to_string(), 10.0), ("description".to_string(), 5.0)],
        }
    }

    #[inline]
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    /// kNN candidates examined per requested result
    #[inline]
    pub fn with_num_candidates_factor(mut self, factor: usize) -> Self {
        self.num_candidates_factor = factor.max(1);
        self
    }

    #[inline]
    pub fn with_lexical_fields(mut self, fields: Vec<(String, f32)>) -> Self {
        self.lexical_fields = fields;
        self
    }

    #[inline]
    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    /// At most `limit` results for `term`, ranked by score
    #[inline]
    pub async fn search(&self, term: &str, limit: usize) -> Result<Vec<SearchResult>> {
        self.search_with_mode(term, limit, self.mode).await
    }

    #[inline]
    pub async fn search_with_mode(
        &self,
        term: &str,
        limit: usize,
        mode: SearchMode,
    ) -> Result<Vec<SearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.check_schema(mode).await?;

        let query = match mode {
            SearchMode::Semantic => SearchQuery {
                knn: Some(self.knn_query(term, limit, None).await?),
                ..self.base_query(limit)
            },
            SearchMode::Lexical => SearchQuery {
                lexical: Some(self.lexical_query(term)),
                ..self.base_query(limit)
            },
            SearchMode::Hybrid => {
                let knn = match self.knn_query(term, limit, Some(HYBRID_KNN_BOOST)).await {
                    Ok(knn) => Some(knn),
                    Err(e) if !e.is_fatal() => {
                        warn!(
                            "Embedding '{}' failed, falling back to lexical search: {}",
                            term, e
                        );
                        None
                    }
                    Err(e) => return Err(e),
                };
                SearchQuery {
                    knn,
                    lexical: Some(self.lexical_query(term)),
                    ..self.base_query(limit)
                }
            }
        };

        let hits = self
            .destination
            .search(&self.index, &query)
            .await
            .map_err(|e| query_failed(&self.index, &e))?;

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .map(|Hit { id, score, source }| SearchResult {
                document_id: id,
                score,
                fields: source,
            })
            .collect();
        rank(&mut results);
        results.truncate(limit);

        debug!(
            "'{}' ({}) matched {} documents in {}",
            term,
            mode,
            results.len(),
            self.index
        );
        Ok(results)
    }

    /// Run each term independently, in input order
    #[inline]
    pub async fn search_many(&self, terms: &[String], limit: usize) -> Vec<TermResults> {
        self.compare_modes(terms, &[self.mode], limit).await
    }

    /// Run every term under each of `modes`; results are grouped by term, in
    /// input order, then by mode in the order given
    #[inline]
    pub async fn compare_modes(
        &self,
        terms: &[String],
        modes: &[SearchMode],
        limit: usize,
    ) -> Vec<TermResults> {
        let mut all = Vec::with_capacity(terms.len() * modes.len());
        for term in terms {
            for &mode in modes {
                let started = Instant::now();
                let outcome = self.search_with_mode(term, limit, mode).await;
                let elapsed = started.elapsed();
                match &outcome {
                    Ok(results) => info!(
                        "'{}' ({}): {} results in {:.2?}",
                        term,
                        mode,
                        results.len(),
                        elapsed
                    ),
                    Err(e) => warn!("'{}' ({}) failed after {:.2?}: {}", term, mode, elapsed, e),
                }
                all.push(TermResults {
                    term: term.clone(),
                    mode,
                    elapsed,
                    outcome,
                });
            }
        }
        all
    }

    fn base_query(&self, limit: usize) -> SearchQuery {
        SearchQuery {
            knn: None,
            lexical: None,
            size: limit,
            exclude_fields: vec![self.vector_field.clone()],
        }
    }

    fn lexical_query(&self, term: &str) -> LexicalQuery {
        LexicalQuery {
            text: term.to_string(),
            fields: self.lexical_fields.clone(),
            boost: LEXICAL_BOOST,
        }
    }

    async fn knn_query(&self, term: &str, limit: usize, boost: Option<f32>) -> Result<KnnQuery> {
        let vector = self.embedder.embed_one(term).await.map_err(|e| {
            if e.is_fatal() {
                e
            } else {
                PipelineError::QueryFailed(format!("could not embed '{term}': {e}"))
            }
        })?;
        Ok(KnnQuery {
            field: self.vector_field.clone(),
            vector: vector.into_inner(),
            k: limit,
            num_candidates: limit.saturating_mul(self.num_candidates_factor),
            boost,
        })
    }

    async fn check_schema(&self, mode: SearchMode) -> Result<()> {
        let state = self
            .destination
            .inspect(&self.index, &self.vector_field)
            .await
            .map_err(|e| query_failed(&self.index, &e))?;

        let mapping = match state {
            IndexState::Missing => {
                return Err(PipelineError::QueryFailed(format!(
                    "index {} does not exist",
                    self.index
                )));
            }
            IndexState::Present { vector_field } => vector_field,
        };
        if mode == SearchMode::Lexical {
            return Ok(());
        }

        match mapping {
            None => Err(PipelineError::SchemaConflict(format!(
                "index {} has no vector field {}",
                self.index, self.vector_field
            ))),
            Some(mapping)
                if mapping.field_type != DENSE_VECTOR
                    || mapping.dims != Some(self.embedder.dimensions()) =>
            {
                Err(PipelineError::SchemaConflict(format!(
                    "field {} in {} is {} with {:?} dimensions, expected {} with {}",
                    self.vector_field,
                    self.index,
                    mapping.field_type,
                    mapping.dims,
                    DENSE_VECTOR,
                    self.embedder.dimensions()
                )))
            }
            Some(_) => Ok(()),
        }
    }
}
