//! WhatsApp Business Cloud API adapter
//!
//! Messages go from the configured business phone number to one recipient
//! (a phone number in international format, or a group id).

use async_trait::async_trait;
use reqwest::multipart::Form;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::config::WhatsAppConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaFile, MediaKind, MediaLimits, MimeType};
use crate::platforms::{file_part, first_media};
use crate::platforms::{missing_field, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v19.0";
const REACTION: &str = "👍";

pub struct WhatsAppPlatform {
    base: PlatformBase,
    phone_number_id: String,
    recipient: String,
    token: Option<String>,
    authenticated: bool,
}

impl WhatsAppPlatform {
    pub fn new(config: &WhatsAppConfig, access_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::WhatsApp, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            phone_number_id: config.phone_number_id.clone(),
            recipient: config.recipient.clone(),
            token: Some(access_token),
            authenticated: false,
        }
    }

    fn token(&self) -> Result<&str> {
        Ok(self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    async fn send_message(&self, context: &str, mut message: Value) -> Result<PostOutcome> {
        message["messaging_product"] = json!("whatsapp");
        message["recipient_type"] = json!("individual");
        message["to"] = json!(self.recipient);

        let url = self.base.url(&format!("{}/messages", self.phone_number_id));
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .bearer_auth(self.token()?)
            .json(&message);
        let body: Value = self.base.send_json(context, request).await?;
        let id = body
            .pointer("/messages/0/id")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("whatsapp", context, "messages[0].id"))?
            .to_string();
        Ok(PostOutcome::new(Network::WhatsApp, id).with_raw(body))
    }

    /// Upload a local file and return its media id
    async fn upload(&self, file: &MediaFile) -> Result<String> {
        let url = self.base.url(&format!("{}/media", self.phone_number_id));
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", file.mime.as_str())
            .part("file", file_part(file).await?);
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .bearer_auth(self.token()?)
            .multipart(form);
        let body: Value = self.base.send_json("upload media", request).await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| missing_field("whatsapp", "upload media", "id").into())
    }

    /// `{"link": ...}` for remote media, `{"id": ...}` after uploading local media
    async fn media_object(&self, file: &MediaFile, caption: &str) -> Result<Value> {
        let mut object = match &file.source_url {
            Some(url) => json!({"link": url}),
            None => json!({"id": self.upload(file).await?}),
        };
        if !caption.is_empty() {
            object["caption"] = json!(caption);
        }
        Ok(object)
    }

    fn with_context(&self, mut message: Value, request: &PostRequest) -> Value {
        if let Some(reply_to) = &request.reply_to {
            message["context"] = json!({"message_id": reply_to});
        }
        message
    }
}

#[async_trait]
impl Platform for WhatsAppPlatform {
    fn network(&self) -> Network {
        Network::WhatsApp
    }

    async fn authenticate(&mut self) -> Result<()> {
        let url = self.base.url(&self.phone_number_id);
        let request = self
            .base
            .http
            .inner()
            .get(url)
            .query(&[("fields", "display_phone_number,verified_name")])
            .bearer_auth(self.token()?);
        let info: Value = self.base.send_json("authenticate", request).await?;
        tracing::debug!(number = ?info.get("display_phone_number"), "whatsapp number verified");
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
        let text = request.text_with_link();

        let message = match request.media.first() {
            None => json!({
                "type": "text",
                "text": {"body": text, "preview_url": request.link.is_some()},
            }),
            Some(_) => {
                let files = self.base.load_media(&request.media, &self.media_limits()).await?;
                let file = &files[0];
                let kind = match file.kind() {
                    MediaKind::Image => "image",
                    MediaKind::Video => "video",
                };
                let mut message = json!({"type": kind});
                message[kind] = self.media_object(file, &text).await?;
                message
            }
        };
        self.send_message("send message", self.with_context(message, request))
            .await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("like").await;
        self.send_message(
            "react",
            json!({
                "type": "reaction",
                "reaction": {"message_id": id, "emoji": REACTION},
            }),
        )
        .await?;
        Ok(PostOutcome::new(Network::WhatsApp, id))
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let source = first_media(Network::WhatsApp, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        let files = self
            .base
            .load_media(std::slice::from_ref(source), &self.media_limits())
            .await?;
        if files[0].kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("whatsapp: {} is not a video", source)).into());
        }
        let video = self.media_object(&files[0], &request.text_with_link()).await?;
        let message = json!({"type": "video", "video": video});
        self.send_message("send video", self.with_context(message, request))
            .await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(4096)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(5, 16, 1)
            .with_image_types(&[MimeType::Jpeg, MimeType::Png])
            .with_video_types(&[MimeType::Mp4])
    }
}
