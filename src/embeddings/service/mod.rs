
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{EmbeddingItem, EmbeddingService, ServiceError};
use crate::http::{HttpClient, HttpResponse, Method, RequestBody};

const ENCODING_FORMAT: &str = "float";
const ERROR_SNIPPET_CHARS: usize = 300;

/// HTTP adapter for the GenAI embeddings endpoint
#[derive(Debug, Clone)]
pub struct GenAiService {
    http: HttpClient,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    instances: Instances<'a>,
    parameters: Parameters<'a>,
}

#[derive(Debug, Serialize)]
struct Instances<'a> {
    texts: &'a [String],
}

#[derive(Debug, Serialize)]
struct Parameters<'a> {
    model: &'a str,
    dimensions: usize,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    #[serde(default)]
    values: Option<Vec<f32>>,
    #[serde(default)]
    error: Option<Value>,
}

impl EmbeddingEntry {
    fn into_item(self) -> EmbeddingItem {
        match (self.values, self.error) {
            (Some(values), None) => EmbeddingItem::Vector(values),
            (_, Some(error)) => EmbeddingItem::Rejected(
                error
                    .as_str()
                    .map_or_else(|| error.to_string(), str::to_string),
            ),
            (None, None) => EmbeddingItem::Rejected("no embedding values returned".to_string()),
        }
    }
}

fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["error", "detail", "message"] {
            match value.get(key) {
                Some(Value::String(message)) => return message.clone(),
                Some(other) if !other.is_null() => return other.to_string(),
                _ => {}
            }
        }
    }
    body.chars().take(ERROR_SNIPPET_CHARS).collect()
}

/// Sort an error status into rate limiting, transient unavailability, or rejection
fn classify(response: &HttpResponse) -> ServiceError {
    let message = error_message(&response.body);
    match response.status {
        429 => ServiceError::RateLimited {
            retry_after: response.retry_after,
            message,
        },
        408 | 500..=599 => ServiceError::Unavailable {
            status: response.status,
            message,
        },
        status => ServiceError::Rejected { status, message },
    }
}

impl GenAiService {
    #[inline]
    pub fn new(
        endpoint: Url,
        api_key: Option<&str>,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Self {
        let authorization = api_key
            .filter(|key| !key.trim().is_empty())
            .map(|key| format!("Bearer {}", key.trim()));

        Self {
            http: HttpClient::new(endpoint, timeout, authorization),
            model: model.to_string(),
            dimensions,
        }
    }

    #[inline]
    pub fn endpoint(&self) -> &Url {
        self.http.base_url()
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingService for GenAiService {
    async fn embed(&self, texts: &[String]) -> Result<Vec<EmbeddingItem>, ServiceError> {
        let request = EmbedRequest {
            instances: Instances { texts },
            parameters: Parameters {
                model: &self.model,
                dimensions: self.dimensions,
                encoding_format: ENCODING_FORMAT,
            },
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| ServiceError::Malformed(format!("could not encode request: {e}")))?;

        debug!(
            "Requesting {} embeddings from {} with model {}",
            texts.len(),
            self.http.base_url(),
            self.model
        );

        let response = self
            .http
            .send(
                Method::Post,
                self.http.base_url().clone(),
                Some(RequestBody::json(&body)),
            )
            .await?;

        if !response.is_success() {
            return Err(classify(&response));
        }

        let parsed: EmbedResponse = serde_json::from_str(&response.body)
            .map_err(|e| ServiceError::Malformed(format!("could not parse response: {e}")))?;

        Ok(parsed
            .embeddings
            .into_iter()
            .map(EmbeddingEntry::into_item)
            .collect())
    }
}
