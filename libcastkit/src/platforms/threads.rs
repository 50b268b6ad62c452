//! Threads API adapter
//!
//! Same container model as Instagram: create a container, wait for media
//! processing, then `threads_publish`. Text-only containers publish at once.

use async_trait::async_trait;
use serde_json::Value;
use zeroize::Zeroize;

use crate::config::ThreadsConfig;
use crate::error::{PlatformError, Result};
use crate::media::{guess_kind, require_url, MediaKind, MediaLimits};
use crate::platforms::instagram::{permalink, wait_for_container, ContainerPoll};
use crate::platforms::first_media;
use crate::platforms::{json_id, missing_field, validate_text, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://graph.threads.net/v1.0";
const CAROUSEL_MAX: usize = 20;

pub struct ThreadsPlatform {
    base: PlatformBase,
    user_id: String,
    token: Option<String>,
    authenticated: bool,
    poll: ContainerPoll,
}

impl ThreadsPlatform {
    pub fn new(config: &ThreadsConfig, access_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::Threads, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
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

    /// Path segment for the account; `me` until authenticate resolves the id
    fn user(&self) -> &str {
        if self.user_id.is_empty() {
            "me"
        } else {
            &self.user_id
        }
    }

    async fn create_container(&self, params: Vec<(&str, String)>) -> Result<String> {
        let url = self.base.url(&format!("{}/threads", self.user()));
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .bearer_auth(self.token()?)
            .form(&params);
        let body: Value = self.base.send_json("create container", request).await?;
        json_id(&body, "id").ok_or_else(|| missing_field("threads", "create container", "id").into())
    }

    fn media_params(url: &str) -> Vec<(&'static str, String)> {
        match guess_kind(url) {
            MediaKind::Image => vec![("media_type", "IMAGE".to_string()), ("image_url", url.to_string())],
            MediaKind::Video => vec![("media_type", "VIDEO".to_string()), ("video_url", url.to_string())],
        }
    }

    async fn wait(&self, container: &str) -> Result<()> {
        wait_for_container(&self.base, self.token()?, container, "status", "error_message", self.poll).await
    }

    async fn publish(&self, container: &str) -> Result<PostOutcome> {
        let token = self.token()?;
        let url = self.base.url(&format!("{}/threads_publish", self.user()));
        let request = self
            .base
            .http
            .inner()
            .post(url)
            .bearer_auth(token)
            .form(&[("creation_id", container)]);
        let body: Value = self.base.send_json("publish", request).await?;
        let id = json_id(&body, "id").ok_or_else(|| missing_field("threads", "publish", "id"))?;

        let mut outcome = PostOutcome::new(Network::Threads, id.clone());
        if let Some(link) = permalink(&self.base, token, &id).await {
            outcome = outcome.with_url(link);
        }
        Ok(outcome.with_raw(body))
    }

    async fn build_container(&self, request: &PostRequest, extra: Vec<(&'static str, String)>) -> Result<String> {
        let urls = request
            .media
            .iter()
            .map(|source| require_url("threads", source))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let text = request.text_with_link();

        let mut params = match urls.as_slice() {
            [] => vec![("media_type", "TEXT".to_string())],
            [single] => Self::media_params(single),
            many => {
                let mut children = Vec::with_capacity(many.len());
                for url in many {
                    let mut params = Self::media_params(url);
                    params.push(("is_carousel_item", "true".to_string()));
                    let child = self.create_container(params).await?;
                    self.wait(&child).await?;
                    children.push(child);
                }
                vec![("media_type", "CAROUSEL".to_string()), ("children", children.join(","))]
            }
        };
        if !text.is_empty() {
            params.push(("text", text));
        }
        if let Some(reply_to) = &request.reply_to {
            params.push(("reply_to_id", reply_to.clone()));
        }
        params.extend(extra);

        let container = self.create_container(params).await?;
        if !urls.is_empty() {
            self.wait(&container).await?;
        }
        Ok(container)
    }
}

#[async_trait]
impl Platform for ThreadsPlatform {
    fn network(&self) -> Network {
        Network::Threads
    }

    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url("me"))
            .query(&[("fields", "id,username")])
            .bearer_auth(self.token()?);
        let me: Value = self.base.send_json("authenticate", request).await?;
        if self.user_id.is_empty() {
            self.user_id = json_id(&me, "id").ok_or_else(|| missing_field("threads", "authenticate", "id"))?;
        }
        tracing::debug!(username = ?me.get("username"), "threads account verified");
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
        let container = self.build_container(request, Vec::new()).await?;
        self.publish(&container).await
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
            return Err(PlatformError::Posting(format!("threads refused to delete {}", id)).into());
        }
        Ok(PostOutcome::new(Network::Threads, id).with_raw(body))
    }

    /// Repost, or quote the post when a comment is given
    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        self.base.call("share").await;
        if let Some(comment) = comment.filter(|c| !c.trim().is_empty()) {
            let quote = PostRequest::text(comment);
            self.validate(&quote)?;
            let container = self
                .build_container(&quote, vec![("quote_post_id", id.to_string())])
                .await?;
            return self.publish(&container).await;
        }

        let request = self
            .base
            .http
            .inner()
            .post(self.base.url(&format!("{}/repost", id)))
            .bearer_auth(self.token()?);
        let body: Value = self.base.send_json("repost", request).await?;
        let repost = json_id(&body, "id").ok_or_else(|| missing_field("threads", "repost", "id"))?;
        Ok(PostOutcome::new(Network::Threads, repost).with_raw(body))
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let url = require_url("threads", first_media(Network::Threads, request)?)?;
        if guess_kind(url) != MediaKind::Video {
            return Err(PlatformError::Validation(format!("threads: {} does not look like a video", url)).into());
        }
        validate_text("threads", request, self.character_limit())?;
        self.base.call("video").await;

        let single = PostRequest {
            media: request.media[..1].to_vec(),
            ..request.clone()
        };
        let container = self.build_container(&single, Vec::new()).await?;
        self.publish(&container).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(500)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(8, 1024, CAROUSEL_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaSource;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(server: &MockServer, user_id: &str) -> ThreadsPlatform {
        let config = ThreadsConfig {
            enabled: true,
            user_id: user_id.to_string(),
            app_id: None,
            app_secret: None,
            api_base: Some(server.uri()),
        };
        ThreadsPlatform::new(&config, "th-token".to_string(), &PlatformSettings::unthrottled().unwrap()).with_poll(
            ContainerPoll {
                interval: Duration::from_millis(10),
                attempts: 5,
            },
        )
    }

    async fn mount_publish(server: &MockServer, container: &str, post_id: &str) {
        Mock::given(method("POST"))
            .and(path("/42/threads_publish"))
            .and(body_string_contains(format!("creation_id={}", container)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": post_id})))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_text_post_skips_polling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/42/threads"))
            .and(body_string_contains("media_type=TEXT"))
            .and(body_string_contains("text=hello+threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        mount_publish(&server, "c1", "t1").await;

        let outcome = platform(&server, "42").post(&PostRequest::text("hello threads")).await.unwrap();
        assert_eq!(outcome.id, "t1");
    }

    #[tokio::test]
    async fn test_image_post_waits_for_container() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/42/threads"))
            .and(body_string_contains("media_type=IMAGE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c2"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "IN_PROGRESS"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "FINISHED"})))
            .mount(&server)
            .await;
        mount_publish(&server, "c2", "t2").await;

        let request = PostRequest::text("pic").with_media(MediaSource::Url("https://cdn.example.com/p.jpg".into()));
        let outcome = platform(&server, "42").post(&request).await.unwrap();
        assert_eq!(outcome.id, "t2");
    }

    #[tokio::test]
    async fn test_authenticate_resolves_user_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "42", "username": "castkit"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/42/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "c3"})))
            .mount(&server)
            .await;
        mount_publish(&server, "c3", "t3").await;

        let mut platform = platform(&server, "");
        platform.authenticate().await.unwrap();
        assert!(platform.is_authenticated());
        platform.post(&PostRequest::text("resolved")).await.unwrap();
    }

    #[tokio::test]
    async fn test_share_without_comment_reposts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/t9/repost"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "rp1"})))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = platform(&server, "42").share("t9", None).await.unwrap();
        assert_eq!(outcome.id, "rp1");
    }

    #[tokio::test]
    async fn test_share_with_comment_quotes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/42/threads"))
            .and(body_string_contains("quote_post_id=t9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "q1"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_publish(&server, "q1", "t10").await;

        let outcome = platform(&server, "42").share("t9", Some("worth reading")).await.unwrap();
        assert_eq!(outcome.id, "t10");
    }

    #[tokio::test]
    async fn test_delete() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/t4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        platform(&server, "42").delete("t4").await.unwrap();
    }

    #[tokio::test]
    async fn test_character_limit_is_500() {
        let server = MockServer::start().await;
        let err = platform(&server, "42")
            .post(&PostRequest::text("a".repeat(501)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500 character limit"));
    }
}
