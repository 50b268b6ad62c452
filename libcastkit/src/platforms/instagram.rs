//! Instagram Graph API adapter (business and creator accounts)
//!
//! Publishing is two-phase: create a media container from a public URL,
//! wait for Instagram to fetch and process it, then publish the container.
//! Instagram downloads the media itself, so local files are rejected.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use zeroize::Zeroize;

use crate::config::InstagramConfig;
use crate::error::{PlatformError, Result};
use crate::media::{guess_kind, require_url, MediaKind, MediaLimits};
use crate::platforms::first_media;
use crate::platforms::{json_id, missing_field, validate_text, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, Placement, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v19.0";
const CAROUSEL_MAX: usize = 10;

/// How often and how long to wait for a media container
#[derive(Debug, Clone, Copy)]
pub struct ContainerPoll {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for ContainerPoll {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            attempts: 60,
        }
    }
}

/// Poll a Meta media container until it is ready to publish
///
/// `status_field` is `status_code` on Instagram and `status` on Threads;
/// `detail_field` carries the failure reason.
pub(crate) async fn wait_for_container(
    base: &PlatformBase,
    token: &str,
    container: &str,
    status_field: &str,
    detail_field: &str,
    poll: ContainerPoll,
) -> Result<()> {
    let fields = format!("{},{}", status_field, detail_field);
    for attempt in 1..=poll.attempts {
        let request = base
            .http
            .inner()
            .get(base.url(container))
            .query(&[("fields", fields.as_str())])
            .bearer_auth(token);
        let body: Value = base.send_json("check container", request).await?;
        let status = body.get(status_field).and_then(Value::as_str).unwrap_or("IN_PROGRESS");
        match status {
            "FINISHED" | "PUBLISHED" => return Ok(()),
            "ERROR" | "EXPIRED" => {
                let detail = body.get(detail_field).and_then(Value::as_str).unwrap_or("no details");
                return Err(PlatformError::Posting(format!(
                    "{} media container {} is {}: {}",
                    base.name(),
                    container,
                    status,
                    detail
                ))
                .into());
            }
            _ => {
                tracing::debug!(network = base.name(), container, attempt, status, "container still processing");
                tokio::time::sleep(poll.interval).await;
            }
        }
    }
    Err(PlatformError::Posting(format!(
        "{} media container {} was not ready after {} checks",
        base.name(),
        container,
        poll.attempts
    ))
    .into())
}

/// Best-effort permalink lookup after publishing
pub(crate) async fn permalink(base: &PlatformBase, token: &str, id: &str) -> Option<String> {
    let request = base
        .http
        .inner()
        .get(base.url(id))
        .query(&[("fields", "permalink")])
        .bearer_auth(token);
    match base.send_json::<Value>("fetch permalink", request).await {
        Ok(body) => body.get("permalink").and_then(Value::as_str).map(str::to_string),
        Err(e) => {
            tracing::debug!(network = base.name(), id, "permalink lookup failed: {}", e);
            None
        }
    }
}

pub struct InstagramPlatform {
    base: PlatformBase,
    user_id: String,
    token: Option<String>,
    authenticated: bool,
    poll: ContainerPoll,
}

impl InstagramPlatform {
    pub fn new(config: &InstagramConfig, access_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::Instagram, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            user_id: config.user_id.clone(),
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

    async fn create_container(&self, params: Vec<(&str, String)>) -> Result<String> {
        let url = self.base.url(&format!("{}/media", self.user_id));
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .bearer_auth(self.token()?)
            .form(&params);
        let body: Value = self.base.send_json("create container", request).await?;
        json_id(&body, "id").ok_or_else(|| missing_field("instagram", "create container", "id").into())
    }

    /// Container parameters for one media URL
    fn media_params(url: &str, placement: Placement) -> Vec<(&'static str, String)> {
        let kind = guess_kind(url);
        let key = match kind {
            MediaKind::Image => "image_url",
            MediaKind::Video => "video_url",
        };
        let mut params = vec![(key, url.to_string())];
        match (placement, kind) {
            (Placement::Story, _) => params.push(("media_type", "STORIES".to_string())),
            (_, MediaKind::Video) => params.push(("media_type", "REELS".to_string())),
            (_, MediaKind::Image) => {}
        }
        params
    }

    async fn publish(&self, container: &str) -> Result<PostOutcome> {
        let token = self.token()?;
        wait_for_container(&self.base, token, container, "status_code", "status", self.poll).await?;

        let url = self.base.url(&format!("{}/media_publish", self.user_id));
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .bearer_auth(token)
            .form(&[("creation_id", container)]);
        let body: Value = self.base.send_json("publish", request).await?;
        let id = json_id(&body, "id").ok_or_else(|| missing_field("instagram", "publish", "id"))?;

        let mut outcome = PostOutcome::new(Network::Instagram, id.clone());
        if let Some(link) = permalink(&self.base, token, &id).await {
            outcome = outcome.with_url(link);
        }
        Ok(outcome.with_raw(body))
    }

    async fn carousel(&self, urls: &[&str], caption: String) -> Result<String> {
        let mut children = Vec::with_capacity(urls.len());
        for url in urls {
            let mut params = Self::media_params(url, Placement::Feed);
            // carousel videos are plain VIDEO items, not reels
            for param in params.iter_mut().filter(|(k, _)| *k == "media_type") {
                param.1 = "VIDEO".to_string();
            }
            params.push(("is_carousel_item", "true".to_string()));
            let child = self.create_container(params).await?;
            wait_for_container(&self.base, self.token()?, &child, "status_code", "status", self.poll).await?;
            children.push(child);
        }
        self.create_container(vec![
            ("media_type", "CAROUSEL".to_string()),
            ("children", children.join(",")),
            ("caption", caption),
        ])
        .await
    }
}

#[async_trait]
impl Platform for InstagramPlatform {
    fn network(&self) -> Network {
        Network::Instagram
    }

    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url(&self.user_id))
            .query(&[("fields", "id,username")])
            .bearer_auth(self.token()?);
        let account: Value = self.base.send_json("authenticate", request).await?;
        tracing::debug!(username = ?account.get("username"), "instagram account verified");
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
        let urls = request
            .media
            .iter()
            .map(|source| require_url("instagram", source))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.base.call("post").await;

        let caption = request.text_with_link();
        let container = if urls.len() > 1 {
            self.carousel(&urls, caption).await?
        } else {
            let mut params = Self::media_params(urls[0], request.placement);
            if request.placement != Placement::Story {
                params.push(("caption", caption));
            }
            self.create_container(params).await?
        };
        self.publish(&container).await
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let url = require_url("instagram", first_media(Network::Instagram, request)?)?;
        validate_text("instagram", request, self.character_limit())?;
        self.base.call("video").await;

        let mut params = vec![("video_url", url.to_string())];
        if request.placement == Placement::Story {
            params.push(("media_type", "STORIES".to_string()));
        } else {
            params.push(("media_type", "REELS".to_string()));
            params.push(("caption", request.text_with_link()));
        }
        let container = self.create_container(params).await?;
        self.publish(&container).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(2200)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(8, 1024, CAROUSEL_MAX)
    }

    fn validate(&self, request: &PostRequest) -> Result<()> {
        validate_text("instagram", request, self.character_limit())?;
        if request.media.is_empty() {
            return Err(PlatformError::Validation(
                "instagram posts need at least one image or video URL".to_string(),
            )
            .into());
        }
        if request.media.len() > CAROUSEL_MAX {
            return Err(PlatformError::Validation(format!(
                "instagram carousels hold at most {} items (got {})",
                CAROUSEL_MAX,
                request.media.len()
            ))
            .into());
        }
        if request.placement == Placement::Story && request.media.len() > 1 {
            return Err(PlatformError::Validation("instagram stories take a single media item".to_string()).into());
        }
        Ok(())
    }
}
