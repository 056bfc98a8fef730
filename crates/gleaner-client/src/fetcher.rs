use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::traits::PageFetcher;
use reqwest::{Client, StatusCode};
use url::Url;

/// HTTP fetcher using reqwest.
///
/// Downloads raw page text with a configurable User-Agent and timeout, and
/// classifies every failure as retryable or fatal for the retry controller.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(concat!("Gleaner/", env!("CARGO_PKG_VERSION"), " (metadata enrichment)"))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, timeout })
    }
}

impl PageFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let parsed = validate_url(url)?;

        let response = self.client.get(parsed).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::retryable_fetch(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout)
            } else {
                AppError::retryable_fetch(format!("Failed to read response body: {e}"))
            }
        })
    }
}

/// Only absolute `http`/`https` URLs are fetchable; anything else can never
/// succeed, so it is fatal.
fn validate_url(url: &str) -> Result<Url, AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::fatal_fetch(format!("Invalid URL '{url}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(AppError::fatal_fetch(format!(
            "URL scheme '{scheme}' is not allowed (only http/https)"
        ))),
    }
}

/// Map a non-success HTTP status to a classified error.
///
/// Throttling, request timeouts and server errors are transient; every other
/// client error means the page will not appear by asking again.
fn classify_status(status: StatusCode, url: &str) -> AppError {
    let message = format!("HTTP {} for {url}", status.as_u16());
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            tracing::warn!(%url, "Rate limited by remote host");
            AppError::RateLimitExceeded
        }
        StatusCode::REQUEST_TIMEOUT => AppError::retryable_fetch(message),
        s if s.is_server_error() => AppError::retryable_fetch(message),
        _ => AppError::fatal_fetch(message),
    }
}
