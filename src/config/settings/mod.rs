
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::retry::RetryPolicy;
use crate::search::SearchMode;
use crate::vector::MAX_DIMENSIONS;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub elasticsearch: ElasticsearchConfig,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub embedding: EmbeddingConfig,
    pub retry: RetryPolicy,
    pub pipeline: PipelineConfig,
    pub search: SearchConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            api_key: None,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub index: String,
    pub page_size: usize,
    /// Unique, sortable field used as the pagination key. It must be a
    /// `keyword` or numeric field: when `id` was mapped dynamically as `text`,
    /// use `id.keyword`.
    pub sort_field: String,
    /// Fields joined, in order, into the text that gets embedded
    pub text_fields: Vec<String>,
    pub point_in_time: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            index: "products_source".to_string(),
            page_size: 100,
            sort_field: "id".to_string(),
            text_fields: vec!["name".to_string(), "description".to_string()],
            point_in_time: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DestinationConfig {
    pub index: String,
    pub vector_field: String,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            index: "products_with_embeddings".to_string(),
            vector_field: "productEmbedding".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    /// Largest number of texts the service accepts in one request
    pub max_request_size: usize,
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/embeddings".to_string(),
            api_key: None,
            model: "text-embedding-model-v1".to_string(),
            dimensions: 512,
            batch_size: 10,
            max_request_size: 256,
            timeout_seconds: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub depth: usize,
    pub max_failed_batches: u32,
    pub max_failure_ratio: f64,
    /// Defaults to `checkpoint.json` in the base directory
    pub checkpoint_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            max_failed_batches: 5,
            max_failure_ratio: 0.1,
            checkpoint_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedField {
    pub field: String,
    pub boost: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub terms_file: PathBuf,
    pub results_limit: usize,
    pub num_candidates_factor: usize,
    /// Modes each term runs under, in order; several modes give a side-by-side comparison
    pub modes: Vec<SearchMode>,
    pub lexical_fields: Vec<WeightedField>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            terms_file: PathBuf::from("terms_to_search.txt"),
            results_limit: 5,
            num_candidates_factor: 10,
            modes: vec![SearchMode::Semantic],
            lexical_fields: vec![
                WeightedField {
                    field: "name".to_string(),
                    boost: 10.0,
                },
                WeightedField {
                    field: "description".to_string(),
                    boost: 5.0,
                },
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL for {0}: {1}")]
    InvalidUrl(&'static str, url::ParseError),
    #[error("Invalid URL scheme for {0}: {1} (must be 'http' or 'https')")]
    InvalidScheme(&'static str, String),
    #[error("Invalid {0}: cannot be empty")]
    EmptyValue(&'static str),
    #[error("Invalid embedding dimensions: {0} (must be between 1 and {MAX_DIMENSIONS})")]
    InvalidDimensions(usize),
    #[error("Invalid batch size: {0} (must be between 1 and max_request_size {1})")]
    InvalidBatchSize(usize, usize),
    #[error("Invalid {0}: {1} (must be greater than 0)")]
    NotPositive(&'static str, u64),
    #[error("Invalid retry multiplier: {0} (must be at least 1.0)")]
    InvalidMultiplier(f64),
    #[error("Invalid max failure ratio: {0} (must be between 0.0 and 1.0)")]
    InvalidFailureRatio(f64),
    #[error("Invalid value for {name}: {value} ({reason})")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

fn parse_env<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|e| ConfigError::InvalidUrl(name, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidScheme(name, other.to_string())),
    }
}

fn check_not_empty(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::EmptyValue(name))
    } else {
        Ok(())
    }
}

fn check_positive(name: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::NotPositive(name, value))
    } else {
        Ok(())
    }
}

impl Config {
    /// Default base directory, `~/.semantic-reindex`
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".semantic-reindex"))
            .or_else(|| dirs::data_dir().map(|data| data.join("semantic-reindex")))
            .ok_or(ConfigError::DirectoryError)
    }

    /// Load `config.toml` from `config_dir`, then apply process environment overrides
    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        Self::load_with_env(config_dir, |name| std::env::var(name).ok())
    }

    /// Like [`Config::load`], reading overrides through `lookup` instead of the process environment
    #[inline]
    pub fn load_with_env<P, F>(config_dir: P, lookup: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let config_path = config_dir.as_ref().join(CONFIG_FILE_NAME);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            toml::from_str(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            Self::default()
        };
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .apply_env_overrides(lookup)
            .context("Invalid environment override")?;
        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    /// Apply the recognised environment variables; blank values are ignored
    #[inline]
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).as_deref().and_then(non_empty);

        if let Some(value) = get("ES_HOST") {
            self.elasticsearch.url = value;
        }
        if let Some(value) = get("ES_API_KEY") {
            self.elasticsearch.api_key = Some(value);
        }
        if let Some(value) = get("OLD_ES_INDEX_NAME") {
            self.source.index = value;
        }
        if let Some(value) = get("NEW_ES_INDEX_NAME") {
            self.destination.index = value;
        }
        if let Some(value) = get("EMBEDDING_FIELD_NAME") {
            self.destination.vector_field = value;
        }
        if let Some(value) = get("GENAI_URL") {
            self.embedding.url = value;
        }
        if let Some(value) = get("GENAI_API_KEY") {
            self.embedding.api_key = Some(value);
        }
        if let Some(value) = get("EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = get("EMBEDDING_DIMENSIONS") {
            self.embedding.dimensions = parse_env("EMBEDDING_DIMENSIONS", &value)?;
        }
        if let Some(value) = get("EMBEDDING_BATCH_SIZE") {
            self.embedding.batch_size = parse_env("EMBEDDING_BATCH_SIZE", &value)?;
        }
        if let Some(value) = get("SEARCH_TERMS_FILE") {
            self.search.terms_file = PathBuf::from(value);
        }
        if let Some(value) = get("SEARCH_RESULTS_LIMIT") {
            self.search.results_limit = parse_env("SEARCH_RESULTS_LIMIT", &value)?;
        }

        Ok(())
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        fs::create_dir_all(&self.base_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                self.base_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_url("elasticsearch.url", &self.elasticsearch.url)?;
        check_positive(
            "elasticsearch.timeout_seconds",
            self.elasticsearch.timeout_seconds,
        )?;

        check_not_empty("source.index", &self.source.index)?;
        check_not_empty("source.sort_field", &self.source.sort_field)?;
        check_positive("source.page_size", self.source.page_size as u64)?;
        if self.source.text_fields.iter().all(|f| f.trim().is_empty()) {
            return Err(ConfigError::EmptyValue("source.text_fields"));
        }

        check_not_empty("destination.index", &self.destination.index)?;
        check_not_empty("destination.vector_field", &self.destination.vector_field)?;

        parse_url("embedding.url", &self.embedding.url)?;
        check_not_empty("embedding.model", &self.embedding.model)?;
        if !(1..=MAX_DIMENSIONS).contains(&self.embedding.dimensions) {
            return Err(ConfigError::InvalidDimensions(self.embedding.dimensions));
        }
        check_positive(
            "embedding.max_request_size",
            self.embedding.max_request_size as u64,
        )?;
        if !(1..=self.embedding.max_request_size).contains(&self.embedding.batch_size) {
            return Err(ConfigError::InvalidBatchSize(
                self.embedding.batch_size,
                self.embedding.max_request_size,
            ));
        }
        check_positive("embedding.timeout_seconds", self.embedding.timeout_seconds)?;

        check_positive("retry.max_attempts", u64::from(self.retry.max_attempts))?;
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.retry.multiplier));
        }

        check_positive("pipeline.depth", self.pipeline.depth as u64)?;
        if !(0.0..=1.0).contains(&self.pipeline.max_failure_ratio) {
            return Err(ConfigError::InvalidFailureRatio(
                self.pipeline.max_failure_ratio,
            ));
        }

        check_positive("search.results_limit", self.search.results_limit as u64)?;
        if self.search.modes.is_empty() {
            return Err(ConfigError::EmptyValue("search.modes"));
        }
        check_positive(
            "search.num_candidates_factor",
            self.search.num_candidates_factor as u64,
        )?;

        Ok(())
    }

    #[inline]
    pub fn elasticsearch_url(&self) -> Result<Url, ConfigError> {
        parse_url("elasticsearch.url", &self.elasticsearch.url)
    }

    #[inline]
    pub fn embedding_url(&self) -> Result<Url, ConfigError> {
        parse_url("embedding.url", &self.embedding.url)
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE_NAME)
    }

    #[inline]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.pipeline
            .checkpoint_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(CHECKPOINT_FILE_NAME))
    }

    #[inline]
    pub fn elasticsearch_timeout(&self) -> Duration {
        Duration::from_secs(self.elasticsearch.timeout_seconds)
    }

    #[inline]
    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_seconds)
    }

    #[inline]
    pub fn lexical_fields(&self) -> Vec<(String, f32)> {
        self.search
            .lexical_fields
            .iter()
            .map(|f| (f.field.clone(), f.boost))
            .collect()
    }
}
