//! TikTok Content Posting API adapter
//!
//! Photo posts are pulled by TikTok from public URLs. Videos are either
//! pulled from a URL or pushed with a chunked `FILE_UPLOAD`. Either way the
//! publish is asynchronous and finishes when `status/fetch` says so.

use async_trait::async_trait;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::config::TikTokConfig;
use crate::error::{PlatformError, Result};
use crate::media::{guess_kind, require_url, MediaFile, MediaKind, MediaLimits, MimeType};
use crate::platforms::instagram::ContainerPoll;
use crate::platforms::first_media;
use crate::platforms::{missing_field, Platform, PlatformBase, PlatformSettings};
use crate::types::{MediaSource, Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://open.tiktokapis.com/v2";

const CHUNK_SIZE: u64 = 10 * 1024 * 1024;
const PHOTO_MAX: usize = 35;
const TITLE_MAX: usize = 90;

pub struct TikTokPlatform {
    base: PlatformBase,
    privacy_level: String,
    token: Option<String>,
    authenticated: bool,
    poll: ContainerPoll,
}

/// Byte ranges for a FILE_UPLOAD: chunks of `CHUNK_SIZE`, the last one
/// absorbing the remainder; files under one chunk go in a single piece
pub fn chunk_ranges(size: u64) -> Vec<(u64, u64)> {
    let count = (size / CHUNK_SIZE).max(1);
    (0..count)
        .map(|i| {
            let start = i * CHUNK_SIZE;
            let end = if i + 1 == count { size } else { start + CHUNK_SIZE };
            (start, end)
        })
        .collect()
}

impl TikTokPlatform {
    pub fn new(config: &TikTokConfig, access_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::TikTok, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            privacy_level: config.privacy_level.clone(),
            token: Some(access_token),
            authenticated: false,
            poll: ContainerPoll::default(),
        }
    }

    pub fn with_poll(mut self, poll: ContainerPoll) -> Self {
        self.poll = poll;
        self
    }

    fn token(&self) -> Result<&str> {
        Ok(self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    /// TikTok answers 200 with `error.code != "ok"` for logical failures
    async fn call_json(&self, context: &str, path: &str, body: &Value) -> Result<Value> {
        let request = self
            .base
            .http
            .inner()
            .post(self.base.url(path))
            .bearer_auth(self.token()?)
            .json(body);
        let response: Value = self.base.send_json(context, request).await?;
        check_error(context, &response)?;
        Ok(response)
    }

    fn post_info(&self, request: &PostRequest, title: String, description: Option<String>) -> Value {
        let mut info = json!({
            "title": title,
            "privacy_level": request.privacy.clone().unwrap_or_else(|| self.privacy_level.clone()),
            "disable_comment": false,
        });
        if let Some(description) = description {
            info["description"] = json!(description);
        }
        info
    }

    async fn photo_post(&self, request: &PostRequest) -> Result<PostOutcome> {
        let urls = request
            .media
            .iter()
            .map(|source| require_url("tiktok", source))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let title: String = request
            .title
            .clone()
            .unwrap_or_default()
            .chars()
            .take(TITLE_MAX)
            .collect();
        let body = json!({
            "post_info": self.post_info(request, title, Some(request.text_with_link())),
            "source_info": {
                "source": "PULL_FROM_URL",
                "photo_cover_index": 0,
                "photo_images": urls,
            },
            "post_mode": "DIRECT_POST",
            "media_type": "PHOTO",
        });
        let response = self.call_json("photo init", "post/publish/content/init/", &body).await?;
        self.finish(publish_id(&response, "photo init")?).await
    }

    async fn video_post(&self, request: &PostRequest, source: &MediaSource) -> Result<PostOutcome> {
        let post_info = self.post_info(request, request.text_with_link(), None);
        if let MediaSource::Url(url) = source {
            let body = json!({
                "post_info": post_info,
                "source_info": {"source": "PULL_FROM_URL", "video_url": url},
            });
            let response = self.call_json("video init", "post/publish/video/init/", &body).await?;
            return self.finish(publish_id(&response, "video init")?).await;
        }

        let files = self
            .base
            .load_media(std::slice::from_ref(source), &self.media_limits())
            .await?;
        let file = &files[0];
        if file.kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("tiktok: {} is not a video", source)).into());
        }
        let ranges = chunk_ranges(file.size);
        let body = json!({
            "post_info": post_info,
            "source_info": {
                "source": "FILE_UPLOAD",
                "video_size": file.size,
                "chunk_size": ranges[0].1 - ranges[0].0,
                "total_chunk_count": ranges.len(),
            },
        });
        let response = self.call_json("video init", "post/publish/video/init/", &body).await?;
        let id = publish_id(&response, "video init")?;
        let upload_url = response
            .pointer("/data/upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("tiktok", "video init", "data.upload_url"))?;
        self.upload_chunks(upload_url, file, &ranges).await?;
        self.finish(id).await
    }

    async fn upload_chunks(&self, upload_url: &str, file: &MediaFile, ranges: &[(u64, u64)]) -> Result<()> {
        for (start, end) in ranges {
            let chunk = file.read_chunk(*start, (end - start) as usize).await?;
            let request = self
                .base
                .http
                .inner()
                .put(upload_url)
                .header("Content-Type", file.mime.as_str())
                .header("Content-Range", format!("bytes {}-{}/{}", start, end - 1, file.size))
                .body(chunk);
            self.base.send("upload chunk", request).await?;
        }
        Ok(())
    }

    /// Poll `status/fetch` until the post is published or handed to the inbox
    async fn finish(&self, publish_id: String) -> Result<PostOutcome> {
        for attempt in 1..=self.poll.attempts {
            let response = self
                .call_json("status fetch", "post/publish/status/fetch/", &json!({"publish_id": publish_id}))
                .await?;
            let data = response.get("data").cloned().unwrap_or(Value::Null);
            match data.get("status").and_then(Value::as_str).unwrap_or("PROCESSING_UPLOAD") {
                "PUBLISH_COMPLETE" | "SEND_TO_USER_INBOX" => {
                    // the public id only exists once moderation lets the post through
                    let post_id = data
                        .get("publicaly_available_post_id")
                        .and_then(Value::as_array)
                        .and_then(|ids| ids.first())
                        .map(|id| match id {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        });
                    return Ok(PostOutcome::new(Network::TikTok, post_id.unwrap_or(publish_id)).with_raw(data));
                }
                "FAILED" => {
                    let reason = data.get("fail_reason").and_then(Value::as_str).unwrap_or("unknown");
                    return Err(PlatformError::Posting(format!("tiktok publish {} failed: {}", publish_id, reason)).into());
                }
                status => {
                    tracing::debug!(publish_id = %publish_id, attempt, status, "tiktok publish in progress");
                    tokio::time::sleep(self.poll.interval).await;
                }
            }
        }
        Err(PlatformError::Posting(format!(
            "tiktok publish {} did not finish after {} checks",
            publish_id, self.poll.attempts
        ))
        .into())
    }
}

fn check_error(context: &str, response: &Value) -> Result<()> {
    let Some(error) = response.get("error") else {
        return Ok(());
    };
    let code = error.get("code").and_then(Value::as_str).unwrap_or("ok");
    if code == "ok" {
        return Ok(());
    }
    let message = error.get("message").and_then(Value::as_str).unwrap_or("");
    let detail = format!("tiktok {} failed: {} {}", context, code, message);
    Err(match code {
        "access_token_invalid" | "scope_not_authorized" | "token_not_authorized_for_specified_deployment" => {
            PlatformError::Authentication(detail)
        }
        "rate_limit_exceeded" | "spam_risk_too_many_posts" => PlatformError::RateLimit(detail),
        _ => PlatformError::Posting(detail),
    }
    .into())
}

fn publish_id(response: &Value, context: &str) -> Result<String> {
    response
        .pointer("/data/publish_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing_field("tiktok", context, "data.publish_id").into())
}

#[async_trait]
impl Platform for TikTokPlatform {
    fn network(&self) -> Network {
        Network::TikTok
    }

    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url("user/info/"))
            .query(&[("fields", "open_id,display_name")])
            .bearer_auth(self.token()?);
        let info: Value = self.base.send_json("authenticate", request).await?;
        check_error("authenticate", &info)?;
        tracing::debug!(user = ?info.pointer("/data/user/display_name"), "tiktok account verified");
        self.authenticated = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(token) = self.token.as_mut() {
            token.zeroize();
        }
        self.token = None;
        self.authenticated = false;
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn post(&self, request: &PostRequest) -> Result<PostOutcome> {
        self.validate(request)?;
        self.base.call("post").await;
        let first = &request.media[0];
        let is_video = match first {
            MediaSource::Url(url) => guess_kind(url) == MediaKind::Video,
            MediaSource::Path(path) => MimeType::from_extension(&path.to_string_lossy())
                .map(|m| m.kind() == MediaKind::Video)
                .unwrap_or(false),
        };
        if is_video {
            if request.media.len() > 1 {
                return Err(PlatformError::Validation("tiktok: a video must be posted on its own".to_string()).into());
            }
            return self.video_post(request, first).await;
        }
        self.photo_post(request).await
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let source = first_media(Network::TikTok, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        self.video_post(request, source).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(2200)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(20, 4096, PHOTO_MAX).with_video_types(&[MimeType::Mp4, MimeType::Mov, MimeType::WebM])
    }

    fn validate(&self, request: &PostRequest) -> Result<()> {
        crate::platforms::validate_text("tiktok", request, self.character_limit())?;
        if request.media.is_empty() {
            return Err(PlatformError::Validation(
                "tiktok needs a video or photos; text-only posts are not possible".to_string(),
            )
            .into());
        }
        if request.media.len() > PHOTO_MAX {
            return Err(PlatformError::Validation(format!(
                "tiktok photo posts hold at most {} images (got {})",
                PHOTO_MAX,
                request.media.len()
            ))
            .into());
        }
        Ok(())
    }
}
