//! Network access used by the strategy engine

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use progload_domain::{Method, Payload, ResourceRequest};
use thiserror::Error;
use tracing::debug;

/// Raw network answer before caching decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    pub status: u16,
    /// Lower-cased header names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl NetworkResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get("content-type")
            .map(String::as_str)
            .unwrap_or("application/octet-stream")
    }

    pub fn payload(&self) -> Payload {
        Payload::from_body(self.content_type(), self.body.clone())
    }
}

/// Failure of one network fetch. Cloneable so a coalesced result can be
/// handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("fetch rejected: {0}")]
    Rejected(String),

    #[error("fetch timed out")]
    TimedOut,
}

/// Performs the actual network request.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, request: &ResourceRequest) -> Result<NetworkResponse, FetchError>;
}

/// reqwest-backed fetcher. Relative request URLs resolve against `base_url`.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Rejected(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn absolute_url(&self, request: &ResourceRequest) -> String {
        match request.origin() {
            Some(_) => request.href().to_string(),
            None => format!("{}{}", self.base_url, request.href()),
        }
    }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<NetworkResponse, FetchError> {
        let url = self.absolute_url(request);
        let method = match request.method() {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
        };

        let builder = self.client.request(method, &url);

        debug!("Fetching {}", url);
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::TimedOut
            } else {
                FetchError::Rejected(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Rejected(e.to_string()))?
            .to_vec();

        Ok(NetworkResponse {
            status,
            headers,
            body,
        })
    }
}
