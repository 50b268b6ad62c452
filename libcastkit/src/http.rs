//! Shared HTTP plumbing for the network adapters

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::PlatformError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Thin wrapper over a `reqwest::Client` that maps failures onto `PlatformError`
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, PlatformError> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, PlatformError> {
        let inner = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("castkit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { inner })
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// Send a request, mapping transport errors and non-2xx statuses
    pub async fn send(
        &self,
        network: &str,
        context: &str,
        request: RequestBuilder,
    ) -> Result<Response, PlatformError> {
        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::transport(network, context, e))?;
        check(network, context, response).await
    }

    /// Send and decode a JSON body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        network: &str,
        context: &str,
        request: RequestBuilder,
    ) -> Result<T, PlatformError> {
        let response = self.send(network, context, request).await?;
        response.json::<T>().await.map_err(|e| {
            PlatformError::Posting(format!(
                "{} returned an unexpected response to {}: {}",
                network, context, e
            ))
        })
    }
}

/// Turn a non-2xx response into a `PlatformError`, passing successes through
pub async fn check(network: &str, context: &str, response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    tracing::debug!(network, context, status = status.as_u16(), "request failed: {}", body);

    Err(match PlatformError::from_status(network, context, status.as_u16(), &body) {
        PlatformError::RateLimit(msg) => match retry_after {
            Some(wait) => PlatformError::RateLimit(format!("{} (retry after {}s)", msg, wait.as_secs())),
            None => PlatformError::RateLimit(msg),
        },
        other => other,
    })
}

/// `Retry-After` in delta-seconds; HTTP-date values are ignored
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
