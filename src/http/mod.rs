// Blocking HTTP transport shared by the Elasticsearch and embedding adapters
// Requests run on the blocking pool so the async runtime is never stalled


use std::time::Duration;

use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestBody {
    pub content: String,
    pub content_type: &'static str,
}

impl RequestBody {
    #[inline]
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            content: value.to_string(),
            content_type: "application/json",
        }
    }

    #[inline]
    pub fn ndjson(content: String) -> Self {
        Self {
            content,
            content_type: "application/x-ndjson",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request error: {0}")]
    Request(String),
}

impl HttpError {
    /// Timeouts and connection failures may succeed on another attempt
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

impl From<ureq::Error> for HttpError {
    fn from(error: ureq::Error) -> Self {
        match &error {
            ureq::Error::Timeout(_) => Self::Timeout(error.to_string()),
            ureq::Error::ConnectionFailed | ureq::Error::HostNotFound | ureq::Error::Io(_) => {
                Self::Connection(error.to_string())
            }
            _ => Self::Request(error.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
    base_url: Url,
    authorization: Option<String>,
}

impl HttpClient {
    /// Create a client rooted at `base_url`. Non-2xx statuses are returned, not raised.
    #[inline]
    pub fn new(base_url: Url, timeout: Duration, authorization: Option<String>) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Self {
            agent,
            base_url,
            authorization,
        }
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Append path segments to the base URL, percent-encoding each one
    #[inline]
    pub fn url(&self, segments: &[&str]) -> Result<Url, HttpError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| HttpError::Request(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    #[inline]
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<RequestBody>,
    ) -> Result<HttpResponse, HttpError> {
        debug!("{} {}", method.as_str(), url);

        let agent = self.agent.clone();
        let authorization = self.authorization.clone();
        tokio::task::spawn_blocking(move || {
            execute(&agent, method, url.as_str(), authorization.as_deref(), body)
        })
        .await
        .map_err(|e| HttpError::Request(format!("request task failed: {e}")))?
    }
}

fn authorize<B>(
    request: ureq::RequestBuilder<B>,
    authorization: Option<&str>,
) -> ureq::RequestBuilder<B> {
    match authorization {
        Some(value) => request.header("Authorization", value),
        None => request,
    }
}

fn execute(
    agent: &ureq::Agent,
    method: Method,
    url: &str,
    authorization: Option<&str>,
    body: Option<RequestBody>,
) -> Result<HttpResponse, HttpError> {
    let result = match (method, body) {
        (Method::Get, _) => authorize(agent.get(url), authorization).call(),
        (Method::Delete, None) => authorize(agent.delete(url), authorization).call(),
        (Method::Delete, Some(body)) => authorize(agent.delete(url), authorization)
            .force_send_body()
            .header("Content-Type", body.content_type)
            .send(body.content),
        (Method::Post, None) => authorize(agent.post(url), authorization).send_empty(),
        (Method::Post, Some(body)) => authorize(agent.post(url), authorization)
            .header("Content-Type", body.content_type)
            .send(body.content),
        (Method::Put, None) => authorize(agent.put(url), authorization).send_empty(),
        (Method::Put, Some(body)) => authorize(agent.put(url), authorization)
            .header("Content-Type", body.content_type)
            .send(body.content),
    };

    let mut response = result?;
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.body_mut().read_to_string()?;

    Ok(HttpResponse {
        status,
        body,
        retry_after,
    })
}
