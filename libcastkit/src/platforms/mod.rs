//! Network adapters
//!
//! Every network implements [`Platform`]: the uniform action vocabulary
//! (post, like, delete, share, video, schedule) over that network's REST API.
//! Adapters embed a [`PlatformBase`] holding the shared HTTP client, the
//! per-operation [`Throttle`] and the API base URL.
//!
//! # Examples
//!
//! ```no_run
//! use libcastkit::platforms::{telegram::TelegramPlatform, Platform, PlatformSettings};
//! use libcastkit::config::TelegramConfig;
//! use libcastkit::types::PostRequest;
//!
//! # async fn example() -> libcastkit::Result<()> {
//! let config = TelegramConfig {
//!     enabled: true,
//!     chat_id: "@my_channel".to_string(),
//!     reaction: "👍".to_string(),
//!     api_base: None,
//! };
//! let settings = PlatformSettings::new(std::time::Duration::from_secs(30), std::time::Duration::from_secs(1))?;
//! let mut platform = TelegramPlatform::new(&config, "123456:bot-token".to_string(), &settings);
//! platform.authenticate().await?;
//!
//! let outcome = platform.post(&PostRequest::text("Hello from castkit")).await?;
//! println!("posted {}", outcome.id);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::Part;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{PlatformError, Result};
use crate::http::HttpClient;
use crate::media::{MediaFactory, MediaFile, MediaLimits};
use crate::rate_limiter::Throttle;
use crate::types::{MediaSource, Network, PostOutcome, PostRequest};

pub mod discord;
pub mod facebook;
pub mod instagram;
pub mod linkedin;
pub mod threads;
pub mod telegram;
pub mod tiktok;
pub mod whatsapp;
pub mod x;
pub mod youtube;

// Mock platform is available for all builds (not just tests) to support integration tests
pub mod mock;

/// Uniform interface over a network's API
#[async_trait]
pub trait Platform: Send + Sync {
    fn network(&self) -> Network;

    /// Lowercase identifier used in output and history
    fn name(&self) -> &str {
        self.network().as_str()
    }

    /// Verify the credentials and fetch whatever ids later calls need
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Authentication` when the network rejects the
    /// credentials.
    async fn authenticate(&mut self) -> Result<()>;

    /// Drop the session and clear tokens from memory
    async fn disconnect(&mut self) -> Result<()>;

    fn is_authenticated(&self) -> bool;

    async fn post(&self, request: &PostRequest) -> Result<PostOutcome>;

    async fn like(&self, _id: &str) -> Result<PostOutcome> {
        Err(PlatformError::unsupported(self.name(), "like").into())
    }

    async fn delete(&self, _id: &str) -> Result<PostOutcome> {
        Err(PlatformError::unsupported(self.name(), "delete").into())
    }

    /// Re-share an existing post, quoting it when `comment` is given
    async fn share(&self, _id: &str, _comment: Option<&str>) -> Result<PostOutcome> {
        Err(PlatformError::unsupported(self.name(), "share").into())
    }

    /// Publish the first media item of the request as a video
    async fn upload_video(&self, _request: &PostRequest) -> Result<PostOutcome> {
        Err(PlatformError::unsupported(self.name(), "video upload").into())
    }

    /// Hand the post to the network's own scheduler
    async fn schedule(&self, _request: &PostRequest, _at: DateTime<Utc>) -> Result<PostOutcome> {
        Err(PlatformError::unsupported(self.name(), "native scheduling").into())
    }

    fn supports_native_schedule(&self) -> bool {
        false
    }

    /// Maximum post length in characters, if the network has one
    fn character_limit(&self) -> Option<usize>;

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::default()
    }

    /// Check a request before any network call is made
    fn validate(&self, request: &PostRequest) -> Result<()> {
        validate_text(self.name(), request, self.character_limit())?;
        if request.media.len() > self.media_limits().max_items {
            return Err(PlatformError::Validation(format!(
                "{} accepts at most {} media items (got {})",
                self.name(),
                self.media_limits().max_items,
                request.media.len()
            ))
            .into());
        }
        Ok(())
    }
}

/// Empty-content and length checks shared by the default `validate`
pub fn validate_text(network: &str, request: &PostRequest, limit: Option<usize>) -> Result<()> {
    let text = request.text_with_link();
    if text.trim().is_empty() && request.media.is_empty() {
        return Err(PlatformError::Validation(format!(
            "{}: content cannot be empty",
            network
        ))
        .into());
    }
    if let Some(limit) = limit {
        let count = text.chars().count();
        if count > limit {
            return Err(PlatformError::Validation(format!(
                "{}: content exceeds {} character limit (got {} characters)",
                network, limit, count
            ))
            .into());
        }
    }
    Ok(())
}

/// Shared construction parameters for adapters
#[derive(Debug, Clone)]
pub struct PlatformSettings {
    pub http: HttpClient,
    /// Minimum spacing between calls of the same operation
    pub min_interval: Duration,
}

impl PlatformSettings {
    pub fn new(timeout: Duration, min_interval: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpClient::with_timeout(timeout)?,
            min_interval,
        })
    }

    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        Self::new(config.request_timeout(), config.rate_limits.min_interval())
    }

    /// No pacing; for tests against a mock server
    pub fn unthrottled() -> Result<Self> {
        Self::new(Duration::from_secs(10), Duration::ZERO)
    }
}

/// State and helpers every adapter embeds
pub struct PlatformBase {
    pub network: Network,
    pub http: HttpClient,
    pub throttle: Throttle,
    pub api_base: String,
    media: MediaFactory,
}

impl PlatformBase {
    pub fn new(network: Network, api_base: Option<&str>, default_base: &str, settings: &PlatformSettings) -> Self {
        Self {
            network,
            http: settings.http.clone(),
            throttle: Throttle::new(settings.min_interval),
            api_base: api_base
                .unwrap_or(default_base)
                .trim_end_matches('/')
                .to_string(),
            media: MediaFactory::new(settings.http.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.network.as_str()
    }

    /// `api_base` joined with `path`
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Wait for the rate limiter slot of `op`
    pub async fn call(&self, op: &str) {
        self.throttle.acquire(op).await;
    }

    /// Error-wrapping helper for transport failures outside [`Self::send`]
    pub fn wrap<'a>(&'a self, context: &'a str) -> impl Fn(reqwest::Error) -> PlatformError + 'a {
        move |e| PlatformError::transport(self.name(), context, e)
    }

    pub async fn send(&self, context: &str, request: RequestBuilder) -> Result<Response> {
        Ok(self.http.send(self.name(), context, request).await?)
    }

    pub async fn send_json<T: DeserializeOwned>(&self, context: &str, request: RequestBuilder) -> Result<T> {
        Ok(self.http.send_json(self.name(), context, request).await?)
    }

    /// Load and validate the request's media against `limits`
    pub async fn load_media(&self, sources: &[MediaSource], limits: &MediaLimits) -> Result<Vec<MediaFile>> {
        self.media.load_all(sources, limits).await
    }

    pub fn not_authenticated(&self) -> PlatformError {
        PlatformError::Authentication(format!(
            "{} is not authenticated; call authenticate() first",
            self.name()
        ))
    }
}

/// String or number field of a JSON object
pub(crate) fn json_id(value: &serde_json::Value, field: &str) -> Option<String> {
    match value.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The media item a video action publishes
pub(crate) fn first_media(network: Network, request: &PostRequest) -> Result<&MediaSource> {
    request.media.first().ok_or_else(|| {
        PlatformError::Validation(format!("{}: the video action needs --media", network)).into()
    })
}

/// Multipart part carrying a downloaded media file
pub(crate) async fn file_part(file: &MediaFile) -> Result<Part> {
    let bytes = file.read().await?;
    Part::bytes(bytes)
        .file_name(file.file_name())
        .mime_str(file.mime.as_str())
        .map_err(|e| PlatformError::Validation(format!("invalid media type: {}", e)).into())
}

/// Error for a 2xx response missing a field we depend on
pub(crate) fn missing_field(network: &str, context: &str, field: &str) -> PlatformError {
    PlatformError::Posting(format!(
        "{} {} response did not contain '{}'",
        network, context, field
    ))
}
