//! Facebook Page adapter (Graph API)
//!
//! Posts are made as the page, using the page access token obtained during
//! `cast-auth authorize facebook`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::Form;
use reqwest::RequestBuilder;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::config::FacebookConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaFile, MediaKind, MediaLimits};
use crate::platforms::{file_part, first_media};
use crate::platforms::{json_id, missing_field, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v19.0";
pub const DEFAULT_VIDEO_BASE: &str = "https://graph-video.facebook.com/v19.0";

/// Scheduled posts must be 10 minutes to 30 days out
const MIN_SCHEDULE_SECS: i64 = 10 * 60;
const MAX_SCHEDULE_SECS: i64 = 30 * 24 * 60 * 60;

pub struct FacebookPlatform {
    base: PlatformBase,
    video_base: String,
    page_id: String,
    token: Option<String>,
    authenticated: bool,
}

impl FacebookPlatform {
    pub fn new(config: &FacebookConfig, page_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::Facebook, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            video_base: config
                .video_base
                .as_deref()
                .unwrap_or(DEFAULT_VIDEO_BASE)
                .trim_end_matches('/')
                .to_string(),
            page_id: config.page_id.clone(),
            token: Some(page_token),
            authenticated: false,
        }
    }

    fn token(&self) -> Result<&str> {
        Ok(self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    fn outcome(&self, body: Value, context: &str) -> Result<PostOutcome> {
        let id = json_id(&body, "post_id")
            .or_else(|| json_id(&body, "id"))
            .ok_or_else(|| missing_field("facebook", context, "id"))?;
        Ok(PostOutcome::new(Network::Facebook, id.clone())
            .with_url(format!("https://www.facebook.com/{}", id))
            .with_raw(body))
    }

    /// `published=false` plus the publish time, or nothing for immediate posts
    fn schedule_params(at: Option<i64>) -> Vec<(String, String)> {
        match at {
            Some(ts) => vec![
                ("published".to_string(), "false".to_string()),
                ("scheduled_publish_time".to_string(), ts.to_string()),
            ],
            None => Vec::new(),
        }
    }

    /// Photo upload by URL (form) or by file (multipart)
    async fn photo_request(&self, file: &MediaFile, params: Vec<(String, String)>) -> Result<RequestBuilder> {
        let url = self.base.url(&format!("{}/photos", self.page_id));
        let builder = self.base.http.inner().post(url).bearer_auth(self.token()?);
        Ok(match &file.source_url {
            Some(source) => {
                let mut params = params;
                params.push(("url".to_string(), source.clone()));
                builder.form(&params)
            }
            None => {
                let mut form = Form::new();
                for (key, value) in params {
                    form = form.text(key, value);
                }
                builder.multipart(form.part("source", file_part(file).await?))
            }
        })
    }

    async fn feed_post(&self, mut params: Vec<(String, String)>) -> Result<PostOutcome> {
        let url = self.base.url(&format!("{}/feed", self.page_id));
        params.retain(|(_, v)| !v.is_empty());
        let request = self.base.http.inner().post(url).bearer_auth(self.token()?).form(&params);
        let body: Value = self.base.send_json("feed post", request).await?;
        self.outcome(body, "feed post")
    }

    /// Shared by `post` and `schedule`
    async fn publish(&self, request: &PostRequest, at: Option<i64>) -> Result<PostOutcome> {
        let files = self.base.load_media(&request.media, &self.media_limits()).await?;
        if files.iter().any(|f| f.kind() == MediaKind::Video) {
            if files.len() > 1 {
                return Err(PlatformError::Validation(
                    "facebook: a video must be posted on its own".to_string(),
                )
                .into());
            }
            return self.video(request, &files[0], at).await;
        }

        let mut params = vec![("message".to_string(), request.content.clone())];
        match files.as_slice() {
            [] => {
                if let Some(link) = &request.link {
                    params.push(("link".to_string(), link.clone()));
                }
                params.extend(Self::schedule_params(at));
                self.feed_post(params).await
            }
            [photo] => {
                let mut params = vec![("caption".to_string(), request.text_with_link())];
                params.extend(Self::schedule_params(at));
                let builder = self.photo_request(photo, params).await?;
                let body: Value = self.base.send_json("photo post", builder).await?;
                self.outcome(body, "photo post")
            }
            photos => {
                // unpublished photos first, then one feed post attaching them
                params[0].1 = request.text_with_link();
                for (i, photo) in photos.iter().enumerate() {
                    let hidden = vec![
                        ("published".to_string(), "false".to_string()),
                        ("temporary".to_string(), at.is_some().to_string()),
                    ];
                    let builder = self.photo_request(photo, hidden).await?;
                    let body: Value = self.base.send_json("photo upload", builder).await?;
                    let fbid = json_id(&body, "id").ok_or_else(|| missing_field("facebook", "photo upload", "id"))?;
                    params.push((format!("attached_media[{}]", i), json!({"media_fbid": fbid}).to_string()));
                }
                params.extend(Self::schedule_params(at));
                self.feed_post(params).await
            }
        }
    }

    async fn video(&self, request: &PostRequest, file: &MediaFile, at: Option<i64>) -> Result<PostOutcome> {
        let url = format!("{}/{}/videos", self.video_base, self.page_id);
        let mut params = vec![("description".to_string(), request.text_with_link())];
        if let Some(title) = &request.title {
            params.push(("title".to_string(), title.clone()));
        }
        params.extend(Self::schedule_params(at));

        let builder = self.base.http.inner().post(url).bearer_auth(self.token()?);
        let builder = match &file.source_url {
            Some(source) => {
                params.push(("file_url".to_string(), source.clone()));
                builder.form(&params)
            }
            None => {
                let mut form = Form::new();
                for (key, value) in params {
                    form = form.text(key, value);
                }
                builder.multipart(form.part("source", file_part(file).await?))
            }
        };
        let body: Value = self.base.send_json("video upload", builder).await?;
        self.outcome(body, "video upload")
    }
}

/// Check a publish time against the Page scheduling window
pub fn check_schedule_window(at: DateTime<Utc>, now: DateTime<Utc>) -> Result<i64> {
    let ahead = (at - now).num_seconds();
    if !(MIN_SCHEDULE_SECS..=MAX_SCHEDULE_SECS).contains(&ahead) {
        return Err(PlatformError::Validation(format!(
            "facebook schedules posts 10 minutes to 30 days ahead; {} is {} minutes away",
            at.to_rfc3339(),
            ahead / 60
        ))
        .into());
    }
    Ok(at.timestamp())
}

#[async_trait]
impl Platform for FacebookPlatform {
    fn network(&self) -> Network {
        Network::Facebook
    }

    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url(&self.page_id))
            .query(&[("fields", "id,name")])
            .bearer_auth(self.token()?);
        let page: Value = self.base.send_json("authenticate", request).await?;
        tracing::debug!(page = ?page.get("name"), "facebook page verified");
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
        self.publish(request, None).await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("like").await;
        let request = self
            .base
            .http
            .inner()
            .post(self.base.url(&format!("{}/likes", id)))
            .bearer_auth(self.token()?);
        let body: Value = self.base.send_json("like", request).await?;
        Ok(PostOutcome::new(Network::Facebook, id).with_raw(body))
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("delete").await;
        let request = self
            .base
            .http
            .inner()
            .delete(self.base.url(id))
            .bearer_auth(self.token()?);
        let body: Value = self.base.send_json("delete", request).await?;
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(PlatformError::Posting(format!("facebook refused to delete {}", id)).into());
        }
        Ok(PostOutcome::new(Network::Facebook, id).with_raw(body))
    }

    /// Page post linking to the shared post
    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        self.base.call("share").await;
        self.feed_post(vec![
            ("message".to_string(), comment.unwrap_or_default().to_string()),
            ("link".to_string(), format!("https://www.facebook.com/{}", id)),
        ])
        .await
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let source = first_media(Network::Facebook, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        let files = self
            .base
            .load_media(std::slice::from_ref(source), &self.media_limits())
            .await?;
        if files[0].kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("facebook: {} is not a video", source)).into());
        }
        self.video(request, &files[0], None).await
    }

    async fn schedule(&self, request: &PostRequest, at: DateTime<Utc>) -> Result<PostOutcome> {
        self.validate(request)?;
        let ts = check_schedule_window(at, Utc::now())?;
        self.base.call("post").await;
        self.publish(request, Some(ts)).await
    }

    fn supports_native_schedule(&self) -> bool {
        true
    }

    fn character_limit(&self) -> Option<usize> {
        Some(63206)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(4, 1024, 10)
    }
}
