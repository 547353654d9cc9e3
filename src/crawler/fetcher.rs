//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with proper user agent strings
//! - The [`PageFetcher`] seam and its reqwest implementation
//! - Classifying responses and transport errors into [`FetchResult`]

use crate::config::UserAgentConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Raw response as returned by a [`PageFetcher`]
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status_code: u16,
    pub body: String,
}

/// Failure below the HTTP layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Connection(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Performs one GET request
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;
}

/// [`PageFetcher`] backed by a shared reqwest client
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<RawResponse, TransportError> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status_code = response.status().as_u16();
        let body = response.text().await?;

        Ok(RawResponse { status_code, body })
    }
}

/// Why a fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No response within the timeout
    Timeout,
    /// Connect or transfer failure
    Connection,
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// HTTP 4xx other than 429
    ClientError,
    /// 1xx, 3xx or a 2xx other than 200
    UnexpectedStatus,
    /// The URL does not parse; nothing was sent
    InvalidUrl,
    /// The request could not be built (e.g. a zero timeout)
    InvalidRequest,
}

impl FailureKind {
    /// Whether a failure of this kind is worth retrying
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::RateLimited | Self::ServerError
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::RateLimited => "rate-limited",
            Self::ServerError => "server-error",
            Self::ClientError => "client-error",
            Self::UnexpectedStatus => "unexpected-status",
            Self::InvalidUrl => "invalid-url",
            Self::InvalidRequest => "invalid-request",
        };
        write!(f, "{}", name)
    }
}

/// A classified fetch failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub retriable: bool,
    pub status_code: Option<u16>,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            retriable: kind.is_retriable(),
            status_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl From<TransportError> for FetchFailure {
    fn from(err: TransportError) -> Self {
        let kind = match &err {
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Connection(_) | TransportError::Other(_) => FailureKind::Connection,
            TransportError::InvalidRequest(_) => FailureKind::InvalidRequest,
        };
        Self::new(kind, None, err.to_string())
    }
}

/// Result of a fetch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// HTTP 200
    Success { status_code: u16, body: String },

    /// Anything else
    Failure(FetchFailure),
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Classifies a raw response
///
/// | Status | Result |
/// |--------|--------|
/// | 200 | Success |
/// | 429 | retriable failure |
/// | 5xx | retriable failure |
/// | other 4xx | permanent failure |
/// | anything else | permanent failure |
pub fn classify_response(response: RawResponse) -> FetchResult {
    let status = StatusCode::from_u16(response.status_code).ok();

    let kind = match status {
        Some(StatusCode::OK) => {
            return FetchResult::Success {
                status_code: response.status_code,
                body: response.body,
            }
        }
        Some(StatusCode::TOO_MANY_REQUESTS) => FailureKind::RateLimited,
        Some(s) if s.is_server_error() => FailureKind::ServerError,
        Some(s) if s.is_client_error() => FailureKind::ClientError,
        _ => FailureKind::UnexpectedStatus,
    };

    let message: String = response.body.chars().take(200).collect();
    FetchResult::Failure(FetchFailure::new(
        kind,
        Some(response.status_code),
        message,
    ))
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use archive_crawl::config::UserAgentConfig;
/// use archive_crawl::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "ArchiveCrawl".to_string(),
///     crawler_version: "0.1".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "ops@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}
