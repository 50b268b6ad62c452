//! X (Twitter) adapter
//!
//! Tweets, likes and retweets use the v2 API; media goes through the v1.1
//! upload endpoint (simple upload for images, INIT/APPEND/FINALIZE/STATUS
//! for video). Every request is signed with OAuth 1.0a user context.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::time::Duration;

use crate::auth::oauth1::{OAuth1Credentials, OAuth1Signer};
use crate::auth::TokenSet;
use crate::config::XConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaFile, MediaKind, MediaLimits};
use crate::platforms::{file_part, first_media};
use crate::platforms::{json_id, missing_field, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://api.x.com";
pub const DEFAULT_UPLOAD_BASE: &str = "https://upload.twitter.com/1.1";

const CHUNK_SIZE: usize = 4 * 1024 * 1024;
const MAX_STATUS_CHECKS: u32 = 60;

pub struct XPlatform {
    base: PlatformBase,
    upload_base: String,
    credentials: Option<OAuth1Credentials>,
    user_id: Option<String>,
    authenticated: bool,
}

impl XPlatform {
    /// `token` is the stored OAuth1 user token; its secret lives in `extra["token_secret"]`
    pub fn new(config: &XConfig, token: &TokenSet, settings: &PlatformSettings) -> Result<Self> {
        let secret = token.extra("token_secret").ok_or_else(|| {
            PlatformError::Authentication(
                "x token has no token_secret; run 'cast-auth authorize x'".to_string(),
            )
        })?;
        let credentials = OAuth1Credentials::consumer(&config.api_key, &config.api_secret)
            .with_token(token.access_token.clone(), secret);
        Ok(Self {
            base: PlatformBase::new(Network::X, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            upload_base: config
                .upload_base
                .as_deref()
                .unwrap_or(DEFAULT_UPLOAD_BASE)
                .trim_end_matches('/')
                .to_string(),
            credentials: Some(credentials),
            user_id: token.extra("user_id").map(str::to_string),
            authenticated: false,
        })
    }

    fn sign(&self, method: &str, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let credentials = self
            .credentials
            .clone()
            .ok_or_else(|| self.base.not_authenticated())?;
        OAuth1Signer::new(credentials).authorization(method, url, params)
    }

    fn user_id(&self) -> Result<&str> {
        Ok(self.user_id.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    fn upload_url(&self) -> String {
        format!("{}/media/upload.json", self.upload_base)
    }

    async fn post_json(&self, context: &str, path: &str, body: &Value) -> Result<Value> {
        let url = self.base.url(path);
        let auth = self.sign("POST", &url, &[])?;
        let request = self
            .base
            .http
            .inner()
            .post(&url)
            .header("Authorization", auth)
            .json(body);
        self.base.send_json(context, request).await
    }

    async fn create_tweet(&self, body: Value) -> Result<PostOutcome> {
        let response = self.post_json("create tweet", "2/tweets", &body).await?;
        let id = response
            .get("data")
            .and_then(|d| json_id(d, "id"))
            .ok_or_else(|| missing_field("x", "create tweet", "data.id"))?;
        Ok(PostOutcome::new(Network::X, id.clone())
            .with_url(format!("https://x.com/i/web/status/{}", id))
            .with_raw(response))
    }

    /// Form-encoded upload command; the form fields are part of the signature
    async fn upload_command(&self, context: &str, params: &[(&str, &str)]) -> Result<Value> {
        let url = self.upload_url();
        let auth = self.sign("POST", &url, params)?;
        let request = self
            .base
            .http
            .inner()
            .post(&url)
            .header("Authorization", auth)
            .form(params);
        self.base.send_json(context, request).await
    }

    async fn upload_simple(&self, file: &MediaFile) -> Result<String> {
        let url = self.upload_url();
        let auth = self.sign("POST", &url, &[])?;
        let form = Form::new().part("media", file_part(file).await?);
        let request = self
            .base
            .http
            .inner()
            .post(&url)
            .header("Authorization", auth)
            .multipart(form);
        let body: Value = self.base.send_json("upload media", request).await?;
        media_id(&body, "upload media")
    }

    async fn upload_chunked(&self, file: &MediaFile) -> Result<String> {
        let total = file.size.to_string();
        let category = match file.kind() {
            MediaKind::Video => "tweet_video",
            MediaKind::Image => "tweet_image",
        };
        let init = self
            .upload_command(
                "upload init",
                &[
                    ("command", "INIT"),
                    ("total_bytes", total.as_str()),
                    ("media_type", file.mime.as_str()),
                    ("media_category", category),
                ],
            )
            .await?;
        let id = media_id(&init, "upload init")?;

        let url = self.upload_url();
        let mut offset: u64 = 0;
        let mut segment = 0u32;
        while offset < file.size {
            let chunk = file.read_chunk(offset, CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len() as u64;
            let auth = self.sign("POST", &url, &[])?;
            let form = Form::new()
                .text("command", "APPEND")
                .text("media_id", id.clone())
                .text("segment_index", segment.to_string())
                .part("media", Part::bytes(chunk).file_name(file.file_name()));
            let request = self
                .base
                .http
                .inner()
                .post(&url)
                .header("Authorization", auth)
                .multipart(form);
            self.base.send("upload append", request).await?;
            tracing::debug!(media_id = %id, segment, offset, "appended media chunk");
            offset += len;
            segment += 1;
        }

        let finalize = self
            .upload_command("upload finalize", &[("command", "FINALIZE"), ("media_id", id.as_str())])
            .await?;
        self.wait_for_processing(&id, finalize).await?;
        Ok(id)
    }

    /// Follow `processing_info` until the upload is usable
    async fn wait_for_processing(&self, id: &str, mut body: Value) -> Result<()> {
        for _ in 0..MAX_STATUS_CHECKS {
            let Some(info) = body.get("processing_info") else {
                return Ok(());
            };
            match info.get("state").and_then(Value::as_str).unwrap_or("pending") {
                "succeeded" => return Ok(()),
                "failed" => {
                    let reason = info
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .unwrap_or("no details");
                    return Err(PlatformError::Posting(format!("x media {} failed processing: {}", id, reason)).into());
                }
                _ => {}
            }
            let wait = info.get("check_after_secs").and_then(Value::as_u64).unwrap_or(1);
            tokio::time::sleep(Duration::from_secs(wait)).await;

            let url = format!("{}?command=STATUS&media_id={}", self.upload_url(), id);
            let auth = self.sign("GET", &url, &[])?;
            let request = self.base.http.inner().get(&url).header("Authorization", auth);
            body = self.base.send_json("upload status", request).await?;
        }
        Err(PlatformError::Posting(format!("x media {} still processing after {} checks", id, MAX_STATUS_CHECKS)).into())
    }

    async fn upload(&self, file: &MediaFile) -> Result<String> {
        match file.kind() {
            MediaKind::Image => self.upload_simple(file).await,
            MediaKind::Video => self.upload_chunked(file).await,
        }
    }

    fn tweet_body(request: &PostRequest, media_ids: Vec<String>) -> Value {
        let mut body = json!({"text": request.text_with_link()});
        if !media_ids.is_empty() {
            body["media"] = json!({"media_ids": media_ids});
        }
        if let Some(reply_to) = &request.reply_to {
            body["reply"] = json!({"in_reply_to_tweet_id": reply_to});
        }
        body
    }
}

fn media_id(body: &Value, context: &str) -> Result<String> {
    json_id(body, "media_id_string")
        .or_else(|| json_id(body, "media_id"))
        .ok_or_else(|| missing_field("x", context, "media_id_string").into())
}

#[async_trait]
impl Platform for XPlatform {
    fn network(&self) -> Network {
        Network::X
    }

    async fn authenticate(&mut self) -> Result<()> {
        let url = self.base.url("2/users/me");
        let auth = self.sign("GET", &url, &[])?;
        let request = self.base.http.inner().get(&url).header("Authorization", auth);
        let me: Value = self.base.send_json("authenticate", request).await?;
        let data = me.get("data").ok_or_else(|| missing_field("x", "authenticate", "data"))?;
        self.user_id = Some(json_id(data, "id").ok_or_else(|| missing_field("x", "authenticate", "data.id"))?);
        tracing::debug!(username = ?data.get("username"), "x account verified");
        self.authenticated = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.credentials = None;
        self.user_id = None;
        self.authenticated = false;
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn post(&self, request: &PostRequest) -> Result<PostOutcome> {
        self.validate(request)?;
        self.base.call("post").await;

        let files = self.base.load_media(&request.media, &self.media_limits()).await?;
        let mut media_ids = Vec::with_capacity(files.len());
        for file in &files {
            self.base.call("upload").await;
            media_ids.push(self.upload(file).await?);
        }
        self.create_tweet(Self::tweet_body(request, media_ids)).await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("like").await;
        let path = format!("2/users/{}/likes", self.user_id()?);
        let body = self.post_json("like", &path, &json!({"tweet_id": id})).await?;
        Ok(PostOutcome::new(Network::X, id).with_raw(body))
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("delete").await;
        let url = self.base.url(&format!("2/tweets/{}", id));
        let auth = self.sign("DELETE", &url, &[])?;
        let request = self.base.http.inner().delete(&url).header("Authorization", auth);
        let body: Value = self.base.send_json("delete", request).await?;
        if body.pointer("/data/deleted").and_then(Value::as_bool) == Some(false) {
            return Err(PlatformError::Posting(format!("x did not delete {}", id)).into());
        }
        Ok(PostOutcome::new(Network::X, id).with_raw(body))
    }

    /// Retweet, or quote tweet when a comment is given
    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        self.base.call("share").await;
        match comment.filter(|c| !c.trim().is_empty()) {
            Some(comment) => {
                let quote = PostRequest::text(comment);
                self.validate(&quote)?;
                self.create_tweet(json!({"text": comment, "quote_tweet_id": id})).await
            }
            None => {
                let path = format!("2/users/{}/retweets", self.user_id()?);
                let body = self.post_json("retweet", &path, &json!({"tweet_id": id})).await?;
                Ok(PostOutcome::new(Network::X, id).with_raw(body))
            }
        }
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let source = first_media(Network::X, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        let files = self
            .base
            .load_media(std::slice::from_ref(source), &self.media_limits())
            .await?;
        let video = &files[0];
        if video.kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("x: {} is not a video", source)).into());
        }
        let id = self.upload_chunked(video).await?;
        self.create_tweet(Self::tweet_body(request, vec![id])).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(280)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(5, 512, 4)
    }
}
