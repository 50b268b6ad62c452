//! Discord bot adapter

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::multipart::Form;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::config::DiscordConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaKind, MediaLimits};
use crate::platforms::{file_part, first_media};
use crate::platforms::{json_id, missing_field, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

pub struct DiscordPlatform {
    base: PlatformBase,
    channel_id: String,
    reaction: String,
    token: Option<String>,
    authenticated: bool,
}

impl DiscordPlatform {
    pub fn new(config: &DiscordConfig, bot_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::Discord, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            channel_id: config.channel_id.clone(),
            reaction: config.reaction.clone(),
            token: Some(bot_token),
            authenticated: false,
        }
    }

    fn auth_header(&self) -> Result<String> {
        let token = self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?;
        Ok(format!("Bot {}", token))
    }

    /// `channel:message`, or a message id in the configured channel
    fn parse_target<'a>(&'a self, id: &'a str) -> (&'a str, &'a str) {
        id.split_once(':').unwrap_or((self.channel_id.as_str(), id))
    }

    fn outcome(&self, body: Value) -> Result<PostOutcome> {
        let id = json_id(&body, "id").ok_or_else(|| missing_field("discord", "create message", "id"))?;
        let channel = json_id(&body, "channel_id").unwrap_or_else(|| self.channel_id.clone());
        let mut outcome = PostOutcome::new(Network::Discord, format!("{}:{}", channel, id));
        if let Some(guild) = json_id(&body, "guild_id") {
            outcome = outcome.with_url(format!("https://discord.com/channels/{}/{}/{}", guild, channel, id));
        }
        Ok(outcome.with_raw(body))
    }

    async fn create_message(&self, request: &PostRequest, media_kind: Option<MediaKind>) -> Result<PostOutcome> {
        let url = self.base.url(&format!("channels/{}/messages", self.channel_id));
        let mut payload = json!({"content": request.text_with_link()});
        if let Some(reply_to) = &request.reply_to {
            let (_, message) = self.parse_target(reply_to);
            payload["message_reference"] = json!({"message_id": message});
        }

        let builder = self.base.http.inner().post(url).header("Authorization", self.auth_header()?);
        let builder = if request.media.is_empty() {
            builder.json(&payload)
        } else {
            let files = self.base.load_media(&request.media, &self.media_limits()).await?;
            if let Some(kind) = media_kind {
                if files.iter().any(|f| f.kind() != kind) {
                    return Err(PlatformError::Validation("discord: video action needs video files".to_string()).into());
                }
            }
            let attachments: Vec<Value> = files
                .iter()
                .enumerate()
                .map(|(i, f)| json!({"id": i, "filename": f.file_name()}))
                .collect();
            payload["attachments"] = Value::Array(attachments);

            let mut form = Form::new().text("payload_json", payload.to_string());
            for (i, file) in files.iter().enumerate() {
                form = form.part(format!("files[{}]", i), file_part(file).await?);
            }
            builder.multipart(form)
        };

        let body: Value = self.base.send_json("create message", builder).await?;
        self.outcome(body)
    }
}

#[async_trait]
impl Platform for DiscordPlatform {
    fn network(&self) -> Network {
        Network::Discord
    }

    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url("users/@me"))
            .header("Authorization", self.auth_header()?);
        let me: Value = self.base.send_json("authenticate", request).await?;
        tracing::debug!(bot = ?me.get("username"), "discord bot verified");
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
        self.create_message(request, None).await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        let (channel, message) = self.parse_target(id);
        self.base.call("like").await;
        let emoji = utf8_percent_encode(&self.reaction, NON_ALPHANUMERIC).to_string();
        let url = self.base.url(&format!(
            "channels/{}/messages/{}/reactions/{}/@me",
            channel, message, emoji
        ));
        let request = self
            .base
            .http
            .inner()
            .put(url)
            .header("Authorization", self.auth_header()?)
            .header("Content-Length", "0");
        self.base.send("add reaction", request).await?;
        Ok(PostOutcome::new(Network::Discord, id))
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        let (channel, message) = self.parse_target(id);
        self.base.call("delete").await;
        let url = self.base.url(&format!("channels/{}/messages/{}", channel, message));
        let request = self
            .base
            .http
            .inner()
            .delete(url)
            .header("Authorization", self.auth_header()?);
        self.base.send("delete message", request).await?;
        Ok(PostOutcome::new(Network::Discord, id))
    }

    /// Crosspost an announcement-channel message to following servers
    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        let (channel, message) = self.parse_target(id);
        self.base.call("share").await;
        let url = self.base.url(&format!("channels/{}/messages/{}/crosspost", channel, message));
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .header("Authorization", self.auth_header()?);
        let body: Value = self.base.send_json("crosspost", request).await?;
        let outcome = self.outcome(body)?;

        if let Some(comment) = comment.filter(|c| !c.trim().is_empty()) {
            let mut reply = PostRequest::text(comment);
            reply.reply_to = Some(message.to_string());
            self.create_message(&reply, None).await?;
        }
        Ok(outcome)
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        first_media(Network::Discord, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        self.create_message(request, Some(MediaKind::Video)).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(2000)
    }

    fn media_limits(&self) -> MediaLimits {
        use crate::media::MimeType;
        MediaLimits::new(10, 10, 10).with_video_types(&[MimeType::Mp4, MimeType::Mov, MimeType::WebM])
    }
}
