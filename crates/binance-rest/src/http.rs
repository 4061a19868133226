//! Thin `reqwest` wrapper: one send path, JSON bodies, status mapping.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

const API_KEY_HEADER: &str = "X-MBX-APIKEY";
const DEFAULT_RETRY_AFTER_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-success status with the raw body.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request build error: {0}")]
    Build(String),
}

impl HttpError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) | Self::RateLimited { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Parse(err.to_string())
        } else if err.is_builder() {
            Self::Build(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

pub struct HttpClient {
    client: Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::Build(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends the request and decodes a JSON body.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<T, HttpError> {
        let body = self.send(method, path, query, api_key).await?;
        serde_json::from_str(&body).map_err(|e| {
            tracing::warn!(path, body = %body, error = %e, "Failed to parse response");
            HttpError::Parse(e.to_string())
        })
    }

    /// Sends the request and discards the body.
    pub async fn request_empty(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<(), HttpError> {
        self.send(method, path, query, api_key).await.map(|_| ())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<String, HttpError> {
        let url = self.build_url(path, query);
        tracing::debug!(method = %method, path, "HTTP request");

        let mut request = self.client.request(method, &url);
        if let Some(key) = api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        Self::read_body(response).await
    }

    async fn read_body(response: Response) -> Result<String, HttpError> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(DEFAULT_RETRY_AFTER_MS);
            return Err(HttpError::RateLimited { retry_after_ms });
        }

        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(HttpError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    fn build_url(&self, path: &str, query: Option<&str>) -> String {
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, path, q),
            _ => format!("{}{}", self.base_url, path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> HttpClient {
        HttpClient::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_build_url() {
        let client = client("https://api.example.com/");
        assert_eq!(client.base_url(), "https://api.example.com");
        assert_eq!(
            client.build_url("/api/v3/depth", Some("symbol=BTCUSDT&limit=1000")),
            "https://api.example.com/api/v3/depth?symbol=BTCUSDT&limit=1000"
        );
        assert_eq!(
            client.build_url("/api/v3/time", Some("")),
            "https://api.example.com/api/v3/time"
        );
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(HttpError::Timeout.is_retryable());
        assert!(HttpError::RateLimited { retry_after_ms: 1 }.is_retryable());
        assert!(HttpError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!HttpError::Status {
            status: 400,
            body: String::new()
        }
        .is_retryable());
    }
}
