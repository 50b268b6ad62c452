//! Telegram Bot API adapter
//!
//! Posts go to one configured chat (a channel `@name` or a numeric id). Post
//! ids are `chat:message` pairs so that like/delete/share can address
//! messages in other chats too; a bare message id refers to the configured
//! chat.

use async_trait::async_trait;
use reqwest::multipart::Form;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::config::TelegramConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaFile, MediaKind, MediaLimits};
use crate::platforms::{file_part, first_media, validate_text, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const MESSAGE_LIMIT: usize = 4096;
const CAPTION_LIMIT: usize = 1024;

pub struct TelegramPlatform {
    base: PlatformBase,
    chat_id: String,
    reaction: String,
    token: Option<String>,
    authenticated: bool,
}

impl TelegramPlatform {
    pub fn new(config: &TelegramConfig, bot_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::Telegram, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            chat_id: config.chat_id.clone(),
            reaction: config.reaction.clone(),
            token: Some(bot_token),
            authenticated: false,
        }
    }

    fn method_url(&self, method: &str) -> Result<String> {
        let token = self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?;
        Ok(self.base.url(&format!("bot{}/{}", token, method)))
    }

    /// Call a Bot API method and unwrap `result`
    async fn api(&self, method: &str, request: reqwest::RequestBuilder) -> Result<Value> {
        let body: Value = self.base.send_json(method, request).await?;
        if body.get("ok").and_then(Value::as_bool) != Some(true) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(PlatformError::Posting(format!("telegram {} failed: {}", method, description)).into());
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn json_call(&self, method: &str, payload: Value) -> Result<Value> {
        let url = self.method_url(method)?;
        self.api(method, self.base.http.inner().post(url).json(&payload)).await
    }

    /// Split a post id into chat and message
    fn parse_target(&self, id: &str) -> Result<(String, i64)> {
        let (chat, message) = match id.rsplit_once(':') {
            Some((chat, message)) => (chat.to_string(), message),
            None => (self.chat_id.clone(), id),
        };
        let message_id = message.trim().parse::<i64>().map_err(|_| {
            PlatformError::Validation(format!(
                "telegram: '{}' is not a message id (expected 'chat:message' or a number)",
                id
            ))
        })?;
        Ok((chat, message_id))
    }

    fn outcome(&self, chat: &str, result: &Value) -> Result<PostOutcome> {
        // sendMediaGroup returns an array; the first message identifies the album
        let message = match result {
            Value::Array(items) => items.first().unwrap_or(&Value::Null),
            other => other,
        };
        let message_id = message
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| super::missing_field("telegram", "send", "message_id"))?;

        let mut outcome = PostOutcome::new(Network::Telegram, format!("{}:{}", chat, message_id))
            .with_raw(result.clone());
        if let Some(channel) = chat.strip_prefix('@') {
            outcome = outcome.with_url(format!("https://t.me/{}/{}", channel, message_id));
        }
        Ok(outcome)
    }

    async fn send_media(&self, request: &PostRequest, files: Vec<MediaFile>) -> Result<PostOutcome> {
        let caption = request.text_with_link();

        if files.len() == 1 {
            let file = &files[0];
            let (method, field) = match file.kind() {
                MediaKind::Image => ("sendPhoto", "photo"),
                MediaKind::Video => ("sendVideo", "video"),
            };
            let url = self.method_url(method)?;
            let mut form = Form::new().text("chat_id", self.chat_id.clone());
            if !caption.is_empty() {
                form = form.text("caption", caption);
            }
            form = match &file.source_url {
                // Telegram fetches public URLs itself
                Some(source) => form.text(field, source.clone()),
                None => form.part(field, file_part(file).await?),
            };
            let result = self.api(method, self.base.http.inner().post(url).multipart(form)).await?;
            return self.outcome(&self.chat_id, &result);
        }

        let url = self.method_url("sendMediaGroup")?;
        let mut form = Form::new().text("chat_id", self.chat_id.clone());
        let mut group = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            let kind = match file.kind() {
                MediaKind::Image => "photo",
                MediaKind::Video => "video",
            };
            let media = match &file.source_url {
                Some(source) => source.clone(),
                None => {
                    let name = format!("file{}", i);
                    form = form.part(name.clone(), file_part(file).await?);
                    format!("attach://{}", name)
                }
            };
            let mut item = json!({"type": kind, "media": media});
            // the album caption lives on the first item
            if i == 0 && !caption.is_empty() {
                item["caption"] = json!(caption);
            }
            group.push(item);
        }
        form = form.text("media", Value::Array(group).to_string());
        let result = self
            .api("sendMediaGroup", self.base.http.inner().post(url).multipart(form))
            .await?;
        self.outcome(&self.chat_id, &result)
    }
}

#[async_trait]
impl Platform for TelegramPlatform {
    fn network(&self) -> Network {
        Network::Telegram
    }

    async fn authenticate(&mut self) -> Result<()> {
        let url = self.method_url("getMe")?;
        let me = self.api("getMe", self.base.http.inner().get(url)).await?;
        tracing::debug!(bot = ?me.get("username"), "telegram bot verified");
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

        if !request.media.is_empty() {
            let files = self.base.load_media(&request.media, &self.media_limits()).await?;
            return self.send_media(request, files).await;
        }

        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": request.text_with_link(),
        });
        if let Some(reply_to) = &request.reply_to {
            let (_, message_id) = self.parse_target(reply_to)?;
            payload["reply_parameters"] = json!({"message_id": message_id});
        }
        let result = self.json_call("sendMessage", payload).await?;
        self.outcome(&self.chat_id, &result)
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        let (chat, message_id) = self.parse_target(id)?;
        self.base.call("like").await;
        self.json_call(
            "setMessageReaction",
            json!({
                "chat_id": chat,
                "message_id": message_id,
                "reaction": [{"type": "emoji", "emoji": self.reaction}],
            }),
        )
        .await?;
        Ok(PostOutcome::new(Network::Telegram, id))
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        let (chat, message_id) = self.parse_target(id)?;
        self.base.call("delete").await;
        self.json_call("deleteMessage", json!({"chat_id": chat, "message_id": message_id}))
            .await?;
        Ok(PostOutcome::new(Network::Telegram, id))
    }

    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        let (from_chat, message_id) = self.parse_target(id)?;
        self.base.call("share").await;
        let result = self
            .json_call(
                "forwardMessage",
                json!({
                    "chat_id": self.chat_id,
                    "from_chat_id": from_chat,
                    "message_id": message_id,
                }),
            )
            .await?;
        let outcome = self.outcome(&self.chat_id, &result)?;

        if let Some(comment) = comment.filter(|c| !c.trim().is_empty()) {
            let forwarded = result.get("message_id").cloned().unwrap_or(Value::Null);
            self.json_call(
                "sendMessage",
                json!({
                    "chat_id": self.chat_id,
                    "text": comment,
                    "reply_parameters": {"message_id": forwarded},
                }),
            )
            .await?;
        }
        Ok(outcome)
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let source = first_media(Network::Telegram, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        let limits = self.media_limits();
        let file = self.base.load_media(std::slice::from_ref(source), &limits).await?;
        if file[0].kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("telegram: {} is not a video", source)).into());
        }
        self.send_media(request, file).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(MESSAGE_LIMIT)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(10, 50, 10)
    }

    fn validate(&self, request: &PostRequest) -> Result<()> {
        let limit = if request.media.is_empty() {
            MESSAGE_LIMIT
        } else {
            CAPTION_LIMIT
        };
        validate_text(self.name(), request, Some(limit))?;
        if request.media.len() > self.media_limits().max_items {
            return Err(PlatformError::Validation(format!(
                "telegram albums hold at most {} items",
                self.media_limits().max_items
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaSource;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn platform(server: &MockServer) -> TelegramPlatform {
        let config = TelegramConfig {
            enabled: true,
            chat_id: "@castkit".to_string(),
            reaction: "🔥".to_string(),
            api_base: Some(server.uri()),
        };
        TelegramPlatform::new(&config, "42:abc".to_string(), &PlatformSettings::unthrottled().unwrap())
    }

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": result}))
    }

    #[tokio::test]
    async fn test_authenticate_calls_get_me() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot42:abc/getMe"))
            .respond_with(ok(json!({"id": 42, "is_bot": true, "username": "castkit_bot"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut platform = platform(&server).await;
        platform.authenticate().await.unwrap();
        assert!(platform.is_authenticated());
    }

    #[tokio::test]
    async fn test_bad_token_is_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bot42:abc/getMe"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"ok": false, "error_code": 401, "description": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let err = platform(&server).await.authenticate().await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_post_text_with_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot42:abc/sendMessage"))
            .and(body_partial_json(json!({
                "chat_id": "@castkit",
                "text": "Release notes https://example.com/r"
            })))
            .respond_with(ok(json!({"message_id": 77, "chat": {"id": -1001}})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = platform(&server)
            .await
            .post(&PostRequest::text("Release notes").with_link("https://example.com/r"))
            .await
            .unwrap();
        assert_eq!(outcome.id, "@castkit:77");
        assert_eq!(outcome.url.as_deref(), Some("https://t.me/castkit/77"));
    }

    #[tokio::test]
    async fn test_like_and_delete_address_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot42:abc/setMessageReaction"))
            .and(body_partial_json(json!({
                "chat_id": "-100555",
                "message_id": 9,
                "reaction": [{"type": "emoji", "emoji": "🔥"}]
            })))
            .respond_with(ok(json!(true)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot42:abc/deleteMessage"))
            .and(body_partial_json(json!({"chat_id": "@castkit", "message_id": 12})))
            .respond_with(ok(json!(true)))
            .expect(1)
            .mount(&server)
            .await;

        let platform = platform(&server).await;
        platform.like("-100555:9").await.unwrap();
        let outcome = platform.delete("12").await.unwrap();
        assert_eq!(outcome.id, "12");
    }

    #[tokio::test]
    async fn test_share_forwards_and_comments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot42:abc/forwardMessage"))
            .and(body_partial_json(json!({"from_chat_id": "@news", "message_id": 3})))
            .respond_with(ok(json!({"message_id": 80})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot42:abc/sendMessage"))
            .and(body_partial_json(json!({"text": "worth reading", "reply_parameters": {"message_id": 80}})))
            .respond_with(ok(json!({"message_id": 81})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = platform(&server)
            .await
            .share("@news:3", Some("worth reading"))
            .await
            .unwrap();
        assert_eq!(outcome.id, "@castkit:80");
    }

    #[tokio::test]
    async fn test_api_error_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot42:abc/sendMessage"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"ok": false, "description": "Bad Request: chat not found"})),
            )
            .mount(&server)
            .await;

        let err = platform(&server)
            .await
            .post(&PostRequest::text("hi"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }

    #[test]
    fn test_caption_limit_applies_with_media() {
        let settings = PlatformSettings::unthrottled().unwrap();
        let config = TelegramConfig {
            enabled: true,
            chat_id: "1".into(),
            reaction: "👍".into(),
            api_base: None,
        };
        let platform = TelegramPlatform::new(&config, "t".into(), &settings);
        let long = "a".repeat(2000);
        assert!(platform.validate(&PostRequest::text(long.clone())).is_ok());
        let with_photo = PostRequest::text(long).with_media(MediaSource::Url("https://x/y.jpg".into()));
        assert!(platform.validate(&with_photo).is_err());
    }

    #[test]
    fn test_parse_target() {
        let settings = PlatformSettings::unthrottled().unwrap();
        let config = TelegramConfig {
            enabled: true,
            chat_id: "@chan".into(),
            reaction: "👍".into(),
            api_base: None,
        };
        let platform = TelegramPlatform::new(&config, "t".into(), &settings);
        assert_eq!(platform.parse_target("5").unwrap(), ("@chan".to_string(), 5));
        assert_eq!(platform.parse_target("-1001:6").unwrap(), ("-1001".to_string(), 6));
        assert!(platform.parse_target("abc").is_err());
    }

    #[tokio::test]
    async fn test_disconnect_clears_token() {
        let server = MockServer::start().await;
        let mut platform = platform(&server).await;
        platform.disconnect().await.unwrap();
        assert!(!platform.is_authenticated());
        let err = platform.post(&PostRequest::text("hi")).await.unwrap_err();
        assert!(err.to_string().contains("not authenticated"));
    }
}
