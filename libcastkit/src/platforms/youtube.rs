//! YouTube Data API adapter
//!
//! Videos go up through the resumable upload protocol:
//!
//! 1. `POST …/videos?uploadType=resumable` with the metadata opens a session;
//!    the session URL comes back in `Location`.
//! 2. Chunks are `PUT` to the session with `Content-Range`. A `308` means
//!    "continue", and its `Range` header says how much the server holds.
//! 3. 500/502/503/504 and transport failures are retried after sleeping
//!    `rand[0,1) * 2^n` seconds, up to `max_retries` times. After a failure
//!    the session is queried (`Content-Range: bytes */total`) so the next
//!    chunk starts where the server actually is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use zeroize::Zeroize;

use crate::config::YouTubeConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaFile, MediaKind, MediaLimits, MimeType};
use crate::platforms::first_media;
use crate::platforms::{missing_field, validate_text, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload";

const RETRIABLE_STATUS: [u16; 4] = [500, 502, 503, 504];
const CHUNK_ALIGN: usize = 256 * 1024;
const TITLE_MAX: usize = 100;

/// Sleep before retry `retry` (1-based): `sample * 2^retry` units, `sample` in [0, 1)
pub fn retry_delay(retry: u32, sample: f64, unit: Duration) -> Duration {
    unit.mul_f64(sample * 2f64.powi(retry as i32))
}

/// Round down to a multiple of 256 KiB, never below one block
pub fn aligned_chunk_size(requested: usize) -> usize {
    (requested / CHUNK_ALIGN).max(1) * CHUNK_ALIGN
}

/// Next byte to send according to a 308 `Range: bytes=0-N` header
fn next_offset(response: &Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('-').next())
        .and_then(|last| last.trim().parse::<u64>().ok())
        .map(|last| last + 1)
        .unwrap_or(0)
}

enum ChunkResult {
    Done(Value),
    Resume(u64),
}

pub struct YouTubePlatform {
    base: PlatformBase,
    upload_base: String,
    category_id: String,
    privacy: String,
    chunk_size: usize,
    max_retries: u32,
    backoff_unit: Duration,
    token: Option<String>,
    channel_id: Option<String>,
    authenticated: bool,
}

impl YouTubePlatform {
    pub fn new(config: &YouTubeConfig, access_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::YouTube, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            upload_base: config
                .upload_base
                .as_deref()
                .unwrap_or(DEFAULT_UPLOAD_BASE)
                .trim_end_matches('/')
                .to_string(),
            category_id: config.category_id.clone(),
            privacy: config.privacy.clone(),
            chunk_size: aligned_chunk_size(config.chunk_size),
            max_retries: config.max_retries,
            backoff_unit: Duration::from_secs(1),
            token: Some(access_token),
            channel_id: None,
            authenticated: false,
        }
    }

    /// Scale the backoff sleeps; one second in production
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    fn token(&self) -> Result<&str> {
        Ok(self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    fn metadata(&self, request: &PostRequest, publish_at: Option<DateTime<Utc>>) -> Value {
        let title = request
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| request.content.lines().next().map(str::to_string))
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Untitled".to_string());
        let title: String = title.chars().take(TITLE_MAX).collect();

        let mut status = json!({
            "privacyStatus": request.privacy.clone().unwrap_or_else(|| self.privacy.clone()),
            "selfDeclaredMadeForKids": false,
        });
        if let Some(at) = publish_at {
            // publishAt only works on private videos
            status["privacyStatus"] = json!("private");
            status["publishAt"] = json!(at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        }
        json!({
            "snippet": {
                "title": title,
                "description": request.text_with_link(),
                "categoryId": self.category_id,
            },
            "status": status,
        })
    }

    async fn start_session(&self, file: &MediaFile, metadata: &Value) -> Result<String> {
        let url = format!("{}/youtube/v3/videos", self.upload_base);
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(self.token()?)
            .header("X-Upload-Content-Length", file.size.to_string())
            .header("X-Upload-Content-Type", file.mime.as_str())
            .json(metadata);
        let response = self.base.send("start upload", request).await?;
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| missing_field("youtube", "start upload", "Location").into())
    }

    /// Classify one session response
    async fn chunk_result(&self, response: Response, context: &str) -> std::result::Result<ChunkResult, PlatformError> {
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let body: Value = response.json().await.map_err(self.base.wrap(context))?;
                Ok(ChunkResult::Done(body))
            }
            StatusCode::PERMANENT_REDIRECT => Ok(ChunkResult::Resume(next_offset(&response))),
            status => {
                let body = response.text().await.unwrap_or_default();
                let code = status.as_u16();
                if RETRIABLE_STATUS.contains(&code) {
                    Err(PlatformError::Network(format!("youtube {} interrupted (HTTP {})", context, code)))
                } else if status.is_server_error() {
                    Err(PlatformError::Posting(format!("youtube {} failed (HTTP {}): {}", context, code, body)))
                } else {
                    Err(PlatformError::from_status("youtube", context, code, &body))
                }
            }
        }
    }

    async fn put_chunk(&self, session: &str, file: &MediaFile, offset: u64) -> std::result::Result<ChunkResult, PlatformError> {
        let chunk = file
            .read_chunk(offset, self.chunk_size)
            .await
            .map_err(|e| PlatformError::Posting(format!("youtube could not read {}: {}", file.path.display(), e)))?;
        let end = offset + chunk.len() as u64 - 1;
        let token = self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?;
        let response = self
            .base
            .http
            .inner()
            .put(session)
            .bearer_auth(token)
            .header("Content-Range", format!("bytes {}-{}/{}", offset, end, file.size))
            .body(chunk)
            .send()
            .await
            .map_err(self.base.wrap("upload chunk"))?;
        self.chunk_result(response, "upload chunk").await
    }

    async fn query_session(&self, session: &str, total: u64) -> std::result::Result<ChunkResult, PlatformError> {
        let token = self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?;
        let response = self
            .base
            .http
            .inner()
            .put(session)
            .bearer_auth(token)
            .header("Content-Range", format!("bytes */{}", total))
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(self.base.wrap("query upload"))?;
        self.chunk_result(response, "query upload").await
    }

    fn is_retriable(error: &PlatformError) -> bool {
        matches!(error, PlatformError::Network(_))
    }

    /// Drive the session until the server reports the video resource
    async fn resumable_upload(&self, session: &str, file: &MediaFile) -> Result<Value> {
        let mut offset: u64 = 0;
        let mut retry: u32 = 0;
        let mut resync = false;

        loop {
            let attempt = if resync || offset >= file.size {
                self.query_session(session, file.size).await
            } else {
                self.put_chunk(session, file, offset).await
            };
            match attempt {
                Ok(ChunkResult::Done(body)) => return Ok(body),
                Ok(ChunkResult::Resume(next)) => {
                    tracing::debug!(offset = next, total = file.size, "youtube upload progress");
                    offset = next;
                    resync = false;
                }
                Err(error) if Self::is_retriable(&error) => {
                    retry += 1;
                    if retry > self.max_retries {
                        return Err(PlatformError::Network(format!(
                            "youtube upload gave up after {} retries: {}",
                            self.max_retries, error
                        ))
                        .into());
                    }
                    let sample: f64 = rand::thread_rng().gen();
                    let delay = retry_delay(retry, sample, self.backoff_unit);
                    tracing::warn!(retry, ?delay, "youtube upload interrupted: {}", error);
                    tokio::time::sleep(delay).await;
                    resync = true;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    async fn upload(&self, request: &PostRequest, publish_at: Option<DateTime<Utc>>) -> Result<PostOutcome> {
        let source = first_media(Network::YouTube, request)?;
        let files = self
            .base
            .load_media(std::slice::from_ref(source), &self.media_limits())
            .await?;
        let file = &files[0];
        if file.kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("youtube: {} is not a video", source)).into());
        }

        let metadata = self.metadata(request, publish_at);
        let session = self.start_session(file, &metadata).await?;
        let body = self.resumable_upload(&session, file).await?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("youtube", "upload", "id"))?
            .to_string();
        Ok(PostOutcome::new(Network::YouTube, id.clone())
            .with_url(format!("https://www.youtube.com/watch?v={}", id))
            .with_raw(body))
    }
}

#[async_trait]
impl Platform for YouTubePlatform {
    fn network(&self) -> Network {
        Network::YouTube
    }

    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url("channels"))
            .query(&[("part", "id,snippet"), ("mine", "true")])
            .bearer_auth(self.token()?);
        let body: Value = self.base.send_json("authenticate", request).await?;
        let channel = body
            .pointer("/items/0/id")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::Authentication("youtube account has no channel".to_string()))?;
        tracing::debug!(channel, "youtube channel verified");
        self.channel_id = Some(channel.to_string());
        self.authenticated = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(token) = self.token.as_mut() {
            token.zeroize();
        }
        self.token = None;
        self.channel_id = None;
        self.authenticated = false;
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn post(&self, request: &PostRequest) -> Result<PostOutcome> {
        if request.media.is_empty() {
            return Err(PlatformError::unsupported("youtube", "posts without a video").into());
        }
        self.upload_video(request).await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("like").await;
        let request = self
            .base
            .http
            .inner()
            .post(self.base.url("videos/rate"))
            .query(&[("id", id), ("rating", "like")])
            .bearer_auth(self.token()?)
            .header("Content-Length", "0");
        self.base.send("rate video", request).await?;
        Ok(PostOutcome::new(Network::YouTube, id))
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("delete").await;
        let request = self
            .base
            .http
            .inner()
            .delete(self.base.url("videos"))
            .query(&[("id", id)])
            .bearer_auth(self.token()?);
        self.base.send("delete video", request).await?;
        Ok(PostOutcome::new(Network::YouTube, id))
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        self.validate(request)?;
        self.base.call("video").await;
        self.upload(request, None).await
    }

    async fn schedule(&self, request: &PostRequest, at: DateTime<Utc>) -> Result<PostOutcome> {
        if at <= Utc::now() {
            return Err(PlatformError::Validation(format!(
                "youtube publish time {} is in the past",
                at.to_rfc3339()
            ))
            .into());
        }
        self.validate(request)?;
        self.base.call("video").await;
        self.upload(request, Some(at)).await
    }

    fn supports_native_schedule(&self) -> bool {
        true
    }

    fn character_limit(&self) -> Option<usize> {
        Some(5000)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(0, 256 * 1024, 1)
            .with_image_types(&[])
            .with_video_types(&[MimeType::Mp4, MimeType::Mov, MimeType::WebM])
    }

    fn validate(&self, request: &PostRequest) -> Result<()> {
        validate_text("youtube", request, self.character_limit())?;
        if request.media.len() != 1 {
            return Err(PlatformError::Validation(format!(
                "youtube uploads exactly one video (got {} media items)",
                request.media.len()
            ))
            .into());
        }
        Ok(())
    }
}
