//! HTTP retrieval of feed documents.
//!
//! Redirects are followed by hand so the caller learns whether the whole
//! chain was permanent. Transient failures (network, timeouts, 5xx, 429,
//! truncated bodies) are retried with exponential backoff; everything else
//! is returned straight away.

use futures::StreamExt;
use reqwest::header::{
    HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION, RETRY_AFTER,
};
use reqwest::{redirect, StatusCode};
use secrecy::ExposeSecret;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::credentials::Credentials;

/// Longest server-requested `Retry-After` we are willing to sleep for.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Errors that can occur while retrieving a feed.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a status we do not handle
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// 429 Too Many Requests, with the server's requested delay if any
    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// 401 or 403; the folder needs (different) credentials
    #[error("Authentication required (HTTP {0})")]
    AuthRequired(u16),
    #[error("Too many redirects (more than {0})")]
    TooManyRedirects(usize),
    #[error("Invalid redirect: {0}")]
    BadRedirect(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_)
            | FetchError::Timeout
            | FetchError::RateLimited { .. }
            | FetchError::IncompleteResponse { .. } => true,
            FetchError::HttpStatus(status) => *status >= 500,
            _ => false,
        }
    }
}

/// Tunables for [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Per-request timeout, covering connect and headers.
    pub timeout: Duration,
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry.
    pub retry_base_delay: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            max_redirects: 5,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: concat!("feedkeep/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// One conditional GET.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub etag: Option<&'a str>,
    pub last_modified: Option<&'a str>,
    /// Sent only to the host of `url`, never to a redirect target elsewhere.
    pub credentials: Option<&'a Credentials>,
}

impl<'a> FetchRequest<'a> {
    pub fn new(url: &'a str) -> Self {
        Self {
            url,
            etag: None,
            last_modified: None,
            credentials: None,
        }
    }
}

/// A 2xx response body with the metadata the store keeps.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub body: Vec<u8>,
    /// URL that finally answered, after redirects.
    pub final_url: String,
    /// Set when every hop of the redirect chain was permanent (301/308).
    pub permanent_url: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Modified(FetchedFeed),
    /// 304; the stored copy is current.
    NotModified { permanent_url: Option<String> },
}

/// Shared HTTP client. Cheap to clone.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(settings.timeout)
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch a document, retrying transient failures.
    pub async fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, FetchError> {
        let mut retry_count = 0;
        loop {
            match self.fetch_once(request).await {
                Err(e) if e.is_transient() && retry_count < self.settings.max_retries => {
                    let delay = match &e {
                        FetchError::RateLimited {
                            retry_after: Some(after),
                        } => (*after).min(MAX_RETRY_AFTER),
                        _ => self.backoff(retry_count),
                    };
                    tracing::warn!(
                        url = request.url,
                        retry = retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                other => return other,
            }
        }
    }

    /// Fetch a small resource unconditionally and return its body.
    pub async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), FetchError> {
        let response = self.follow(&FetchRequest::new(url)).await?;
        let status = response.response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        let content_type = header_string(response.response.headers(), reqwest::header::CONTENT_TYPE);
        let body = read_limited_bytes(response.response, self.settings.max_body_bytes).await?;
        Ok((body, content_type))
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.settings
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry_count))
    }

    async fn fetch_once(&self, request: &FetchRequest<'_>) -> Result<FetchOutcome, FetchError> {
        let Followed {
            response,
            final_url,
            permanent_url,
        } = self.follow(request).await?;

        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => {
                tracing::debug!(url = request.url, "Feed not modified");
                return Ok(FetchOutcome::NotModified { permanent_url });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::AuthRequired(status.as_u16()));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(FetchError::RateLimited {
                    retry_after: retry_after(response.headers()),
                });
            }
            s if !s.is_success() => return Err(FetchError::HttpStatus(s.as_u16())),
            _ => {}
        }

        let etag = header_string(response.headers(), ETAG);
        let last_modified = header_string(response.headers(), LAST_MODIFIED);
        let body = read_limited_bytes(response, self.settings.max_body_bytes).await?;
        Ok(FetchOutcome::Modified(FetchedFeed {
            body,
            final_url,
            permanent_url,
            etag,
            last_modified,
        }))
    }

    /// Send the request and walk the redirect chain.
    async fn follow(&self, request: &FetchRequest<'_>) -> Result<Followed, FetchError> {
        let origin = Url::parse(request.url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let mut url = origin.clone();
        let mut hops = 0usize;
        let mut all_permanent = true;

        loop {
            let mut builder = self.client.get(url.clone());
            if let Some(etag) = request.etag {
                builder = builder.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = request.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, last_modified);
            }
            if let Some(creds) = request.credentials {
                if same_origin(&url, &origin) {
                    builder = builder.basic_auth(&creds.username, Some(creds.password.expose_secret()));
                }
            }

            let response = tokio::time::timeout(self.settings.timeout, builder.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();
            if !status.is_redirection() || status == StatusCode::NOT_MODIFIED {
                let permanent_url = (hops > 0 && all_permanent).then(|| url.to_string());
                return Ok(Followed {
                    response,
                    final_url: url.to_string(),
                    permanent_url,
                });
            }

            hops += 1;
            if hops > self.settings.max_redirects {
                return Err(FetchError::TooManyRedirects(self.settings.max_redirects));
            }
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| FetchError::BadRedirect(format!("{status} without Location")))?;
            let next = url
                .join(location)
                .map_err(|e| FetchError::BadRedirect(e.to_string()))?;
            if !matches!(next.scheme(), "http" | "https") {
                return Err(FetchError::BadRedirect(format!("unsupported scheme in {next}")));
            }
            let permanent = matches!(
                status,
                StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT
            );
            all_permanent &= permanent;
            tracing::debug!(from = %url, to = %next, status = status.as_u16(), permanent, "Following redirect");
            url = next;
        }
    }
}

struct Followed {
    response: reqwest::Response,
    final_url: String,
    permanent_url: Option<String>,
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// `Retry-After` in delta-seconds. HTTP-date values fall back to backoff.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_string(headers, RETRY_AFTER)?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
