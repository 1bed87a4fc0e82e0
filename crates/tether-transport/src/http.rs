//! Shared HTTP plumbing for the SSE and streamable HTTP transports.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tether_types::TransportError;

/// Longest error body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 1024;

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

/// Settings shared by the HTTP-based transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Server URL (the SSE stream, or the single MCP endpoint).
    pub url: String,
    /// Extra headers sent on every request (e.g. `Authorization`).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Retries after a failed initial connection (default: 3).
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Delay before the first retry, doubled on each further attempt.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms).saturating_mul(1u32 << retry.min(16))
    }

    pub(crate) fn parse_url(&self) -> Result<Url, TransportError> {
        Url::parse(&self.url)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid URL '{}': {e}", self.url)))
    }

    /// Build a client that sends the configured headers on every request.
    pub(crate) fn client(&self) -> Result<reqwest::Client, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                TransportError::InvalidConfig(format!("invalid header name '{name}'"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                TransportError::InvalidConfig(format!("invalid value for header '{name}'"))
            })?;
            headers.insert(name, value);
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))
    }
}

/// Whether a failed attempt is worth repeating.
pub(crate) fn is_retryable(err: &TransportError) -> bool {
    match err {
        TransportError::Http(_) => true,
        TransportError::Status { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        _ => false,
    }
}

pub(crate) fn network_error(e: reqwest::Error) -> TransportError {
    TransportError::Http(e.to_string())
}

/// Turn a non-success response into a `Status` error carrying (part of)
/// its body.
pub(crate) async fn status_error(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    TransportError::Status { status, body }
}

/// Media type of a response, without parameters, lowercased.
pub(crate) fn content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}
