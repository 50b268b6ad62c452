//! LinkedIn Posts API adapter (versioned `/rest` endpoints)

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::RequestBuilder;
use serde_json::{json, Value};
use zeroize::Zeroize;

use crate::config::LinkedInConfig;
use crate::error::{PlatformError, Result};
use crate::media::{MediaFile, MediaKind, MediaLimits};
use crate::platforms::first_media;
use crate::platforms::{missing_field, Platform, PlatformBase, PlatformSettings};
use crate::types::{Network, PostOutcome, PostRequest};

pub const DEFAULT_API_BASE: &str = "https://api.linkedin.com";
const RESTLI_VERSION: &str = "2.0.0";

pub struct LinkedInPlatform {
    base: PlatformBase,
    api_version: String,
    author: Option<String>,
    token: Option<String>,
    authenticated: bool,
}

impl LinkedInPlatform {
    pub fn new(config: &LinkedInConfig, access_token: String, settings: &PlatformSettings) -> Self {
        Self {
            base: PlatformBase::new(Network::LinkedIn, config.api_base.as_deref(), DEFAULT_API_BASE, settings),
            api_version: config.api_version.clone(),
            author: config.author_urn.clone().filter(|urn| !urn.is_empty()),
            token: Some(access_token),
            authenticated: false,
        }
    }

    fn token(&self) -> Result<&str> {
        Ok(self.token.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    fn author(&self) -> Result<&str> {
        Ok(self.author.as_deref().ok_or_else(|| self.base.not_authenticated())?)
    }

    /// Bearer token plus the versioning headers every `/rest` call needs
    fn rest(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        Ok(builder
            .bearer_auth(self.token()?)
            .header("LinkedIn-Version", &self.api_version)
            .header("X-Restli-Protocol-Version", RESTLI_VERSION))
    }

    fn encode_urn(urn: &str) -> String {
        utf8_percent_encode(urn, NON_ALPHANUMERIC).to_string()
    }

    async fn create_post(&self, body: Value) -> Result<PostOutcome> {
        let request = self.rest(self.base.http.inner().post(self.base.url("rest/posts")))?.json(&body);
        let response = self.base.send("create post", request).await?;
        let urn = response
            .headers()
            .get("x-restli-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| missing_field("linkedin", "create post", "x-restli-id"))?;
        Ok(PostOutcome::new(Network::LinkedIn, urn.clone())
            .with_url(format!("https://www.linkedin.com/feed/update/{}/", urn))
            .with_raw(body))
    }

    fn post_body(&self, commentary: &str) -> Result<Value> {
        Ok(json!({
            "author": self.author()?,
            "commentary": commentary,
            "visibility": "PUBLIC",
            "distribution": {
                "feedDistribution": "MAIN_FEED",
                "targetEntities": [],
                "thirdPartyDistributionChannels": []
            },
            "lifecycleState": "PUBLISHED",
            "isReshareDisabledByAuthor": false
        }))
    }

    async fn initialize_upload(&self, kind: &str, request: Value) -> Result<Value> {
        let url = self.base.url(&format!("rest/{}", kind));
        let builder = self
            .rest(self.base.http.inner().post(url))?
            .query(&[("action", "initializeUpload")])
            .json(&json!({"initializeUploadRequest": request}));
        let body: Value = self.base.send_json("initialize upload", builder).await?;
        body.get("value")
            .cloned()
            .ok_or_else(|| missing_field("linkedin", "initialize upload", "value").into())
    }

    async fn upload_image(&self, file: &MediaFile) -> Result<String> {
        let value = self.initialize_upload("images", json!({"owner": self.author()?})).await?;
        let upload_url = value
            .get("uploadUrl")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("linkedin", "initialize upload", "uploadUrl"))?;
        let image = value
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("linkedin", "initialize upload", "image"))?
            .to_string();

        let request = self
            .base
            .http
            .inner()
            .put(upload_url)
            .bearer_auth(self.token()?)
            .header("Content-Type", file.mime.as_str())
            .body(file.read().await?);
        self.base.send("upload image", request).await?;
        Ok(image)
    }

    /// initializeUpload, one PUT per instruction, then finalizeUpload with the ETags
    async fn upload_video_file(&self, file: &MediaFile) -> Result<String> {
        let value = self
            .initialize_upload(
                "videos",
                json!({
                    "owner": self.author()?,
                    "fileSizeBytes": file.size,
                    "uploadCaptions": false,
                    "uploadThumbnail": false
                }),
            )
            .await?;
        let video = value
            .get("video")
            .and_then(Value::as_str)
            .ok_or_else(|| missing_field("linkedin", "initialize upload", "video"))?
            .to_string();
        let upload_token = value.get("uploadToken").and_then(Value::as_str).unwrap_or_default();
        let instructions = value
            .get("uploadInstructions")
            .and_then(Value::as_array)
            .ok_or_else(|| missing_field("linkedin", "initialize upload", "uploadInstructions"))?;

        let mut etags = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            let url = instruction
                .get("uploadUrl")
                .and_then(Value::as_str)
                .ok_or_else(|| missing_field("linkedin", "upload instruction", "uploadUrl"))?;
            let first = instruction.get("firstByte").and_then(Value::as_u64).unwrap_or(0);
            let last = instruction
                .get("lastByte")
                .and_then(Value::as_u64)
                .unwrap_or(file.size.saturating_sub(1));
            let chunk = file.read_chunk(first, (last - first + 1) as usize).await?;

            let request = self
                .base
                .http
                .inner()
                .put(url)
                .bearer_auth(self.token()?)
                .header("Content-Type", "application/octet-stream")
                .body(chunk);
            let response = self.base.send("upload video part", request).await?;
            let etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| missing_field("linkedin", "upload video part", "ETag"))?;
            etags.push(etag.to_string());
        }

        let finalize = self
            .rest(self.base.http.inner().post(self.base.url("rest/videos")))?
            .query(&[("action", "finalizeUpload")])
            .json(&json!({
                "finalizeUploadRequest": {
                    "video": video,
                    "uploadToken": upload_token,
                    "uploadedPartIds": etags
                }
            }));
        self.base.send("finalize upload", finalize).await?;
        tracing::debug!(video = %video, parts = etags.len(), "linkedin video uploaded");
        Ok(video)
    }
}

#[async_trait]
impl Platform for LinkedInPlatform {
    fn network(&self) -> Network {
        Network::LinkedIn
    }

    /// Resolves the member URN through OpenID userinfo unless configured
    async fn authenticate(&mut self) -> Result<()> {
        let request = self
            .base
            .http
            .inner()
            .get(self.base.url("v2/userinfo"))
            .bearer_auth(self.token()?);
        let info: Value = self.base.send_json("authenticate", request).await?;
        if self.author.is_none() {
            let sub = info
                .get("sub")
                .and_then(Value::as_str)
                .ok_or_else(|| missing_field("linkedin", "userinfo", "sub"))?;
            self.author = Some(format!("urn:li:person:{}", sub));
        }
        tracing::debug!(author = ?self.author, "linkedin member verified");
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

        let files = self.base.load_media(&request.media, &self.media_limits()).await?;
        let mut body = self.post_body(&request.content)?;
        match files.as_slice() {
            [] => {
                if let Some(link) = &request.link {
                    body["content"] = json!({"article": {
                        "source": link,
                        "title": request.title.clone().unwrap_or_else(|| link.clone())
                    }});
                }
            }
            [video] if video.kind() == MediaKind::Video => {
                body["commentary"] = json!(request.text_with_link());
                let urn = self.upload_video_file(video).await?;
                body["content"] = json!({"media": {"id": urn, "title": request.title.clone().unwrap_or_default()}});
            }
            [image] => {
                body["commentary"] = json!(request.text_with_link());
                let urn = self.upload_image(image).await?;
                body["content"] = json!({"media": {"id": urn}});
            }
            images => {
                if images.iter().any(|f| f.kind() == MediaKind::Video) {
                    return Err(PlatformError::Validation(
                        "linkedin: videos cannot be mixed with other media".to_string(),
                    )
                    .into());
                }
                body["commentary"] = json!(request.text_with_link());
                let mut ids = Vec::with_capacity(images.len());
                for image in images {
                    ids.push(json!({"id": self.upload_image(image).await?}));
                }
                body["content"] = json!({"multiImage": {"images": ids}});
            }
        }
        self.create_post(body).await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("like").await;
        let actor = self.author()?;
        let request = self
            .rest(self.base.http.inner().post(self.base.url("rest/reactions")))?
            .query(&[("actor", actor)])
            .json(&json!({"root": id, "reactionType": "LIKE"}));
        self.base.send("react", request).await?;
        Ok(PostOutcome::new(Network::LinkedIn, id))
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        self.base.call("delete").await;
        let url = self.base.url(&format!("rest/posts/{}", Self::encode_urn(id)));
        let request = self.rest(self.base.http.inner().delete(url))?;
        self.base.send("delete post", request).await?;
        Ok(PostOutcome::new(Network::LinkedIn, id))
    }

    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        let commentary = comment.unwrap_or_default();
        validate_commentary(commentary, self.character_limit())?;
        self.base.call("share").await;
        let mut body = self.post_body(commentary)?;
        body["reshareContext"] = json!({"parent": id});
        self.create_post(body).await
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        let source = first_media(Network::LinkedIn, request)?;
        self.validate(request)?;
        self.base.call("video").await;
        let files = self
            .base
            .load_media(std::slice::from_ref(source), &self.media_limits())
            .await?;
        if files[0].kind() != MediaKind::Video {
            return Err(PlatformError::Validation(format!("linkedin: {} is not a video", source)).into());
        }
        let urn = self.upload_video_file(&files[0]).await?;
        let mut body = self.post_body(&request.text_with_link())?;
        body["content"] = json!({"media": {"id": urn, "title": request.title.clone().unwrap_or_default()}});
        self.create_post(body).await
    }

    fn character_limit(&self) -> Option<usize> {
        Some(3000)
    }

    fn media_limits(&self) -> MediaLimits {
        MediaLimits::new(8, 500, 20)
    }
}

fn validate_commentary(text: &str, limit: Option<usize>) -> Result<()> {
    match limit {
        Some(limit) if text.chars().count() > limit => Err(PlatformError::Validation(format!(
            "linkedin: content exceeds {} character limit",
            limit
        ))
        .into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaSource;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(server: &MockServer, author: Option<&str>) -> LinkedInPlatform {
        let config = LinkedInConfig {
            enabled: true,
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            author_urn: author.map(str::to_string),
            api_version: "202405".to_string(),
            api_base: Some(server.uri()),
        };
        LinkedInPlatform::new(&config, "li-token".to_string(), &PlatformSettings::unthrottled().unwrap())
    }

    fn created(urn: &str) -> ResponseTemplate {
        ResponseTemplate::new(201).insert_header("x-restli-id", urn)
    }

    #[tokio::test]
    async fn test_text_post_sends_version_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(header("linkedin-version", "202405"))
            .and(header("x-restli-protocol-version", "2.0.0"))
            .and(body_partial_json(json!({
                "author": "urn:li:person:abc",
                "commentary": "hello linkedin",
                "lifecycleState": "PUBLISHED"
            })))
            .respond_with(created("urn:li:share:1"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = platform(&server, Some("urn:li:person:abc"))
            .post(&PostRequest::text("hello linkedin"))
            .await
            .unwrap();
        assert_eq!(outcome.id, "urn:li:share:1");
        assert_eq!(
            outcome.url.as_deref(),
            Some("https://www.linkedin.com/feed/update/urn:li:share:1/")
        );
    }

    #[tokio::test]
    async fn test_authenticate_resolves_author() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sub": "xyz", "name": "Ada"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(body_partial_json(json!({"author": "urn:li:person:xyz"})))
            .respond_with(created("urn:li:share:2"))
            .expect(1)
            .mount(&server)
            .await;

        let mut platform = platform(&server, None);
        assert!(platform.post(&PostRequest::text("early")).await.is_err());
        platform.authenticate().await.unwrap();
        platform.post(&PostRequest::text("now")).await.unwrap();
    }

    #[tokio::test]
    async fn test_link_becomes_article() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(body_partial_json(json!({
                "commentary": "read this",
                "content": {"article": {"source": "https://example.com/post"}}
            })))
            .respond_with(created("urn:li:share:3"))
            .expect(1)
            .mount(&server)
            .await;

        let request = PostRequest::text("read this").with_link("https://example.com/post");
        platform(&server, Some("urn:li:person:abc")).post(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_image_upload_flow() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("chart.png");
        std::fs::write(&file, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 5, 5]).unwrap();

        Mock::given(method("POST"))
            .and(path("/rest/images"))
            .and(query_param("action", "initializeUpload"))
            .and(body_partial_json(json!({"initializeUploadRequest": {"owner": "urn:li:person:abc"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": {
                "uploadUrl": format!("{}/upload/img1", server.uri()),
                "image": "urn:li:image:img1"
            }})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/img1"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(body_partial_json(json!({"content": {"media": {"id": "urn:li:image:img1"}}})))
            .respond_with(created("urn:li:share:4"))
            .expect(1)
            .mount(&server)
            .await;

        let request = PostRequest::text("chart").with_media(MediaSource::Path(file));
        platform(&server, Some("urn:li:person:abc")).post(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_video_upload_collects_etags() {
        let server = MockServer::start().await;
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("demo.mp4");
        let mut bytes = vec![0, 0, 0, 0x18];
        bytes.extend_from_slice(b"ftypisom");
        bytes.extend_from_slice(&[3; 20]);
        std::fs::write(&file, &bytes).unwrap();

        Mock::given(method("POST"))
            .and(path("/rest/videos"))
            .and(query_param("action", "initializeUpload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": {
                "video": "urn:li:video:v1",
                "uploadToken": "tok",
                "uploadInstructions": [
                    {"uploadUrl": format!("{}/upload/part1", server.uri()), "firstByte": 0, "lastByte": 15},
                    {"uploadUrl": format!("{}/upload/part2", server.uri()), "firstByte": 16, "lastByte": 31}
                ]
            }})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/part1"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "etag-1"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/part2"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "etag-2"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/videos"))
            .and(query_param("action", "finalizeUpload"))
            .and(body_partial_json(json!({"finalizeUploadRequest": {
                "video": "urn:li:video:v1",
                "uploadToken": "tok",
                "uploadedPartIds": ["etag-1", "etag-2"]
            }})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(body_partial_json(json!({"content": {"media": {"id": "urn:li:video:v1"}}})))
            .respond_with(created("urn:li:share:5"))
            .expect(1)
            .mount(&server)
            .await;

        let request = PostRequest::text("demo").with_media(MediaSource::Path(file));
        let outcome = platform(&server, Some("urn:li:person:abc"))
            .upload_video(&request)
            .await
            .unwrap();
        assert_eq!(outcome.id, "urn:li:share:5");

        let received = server.received_requests().await.unwrap();
        let part2 = received.iter().find(|r| r.url.path() == "/upload/part2").unwrap();
        assert_eq!(part2.body.len(), 16);
    }

    #[tokio::test]
    async fn test_like_delete_reshare() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/reactions"))
            .and(query_param("actor", "urn:li:person:abc"))
            .and(body_partial_json(json!({"root": "urn:li:share:9", "reactionType": "LIKE"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/posts/urn%3Ali%3Ashare%3A9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/posts"))
            .and(body_partial_json(json!({"reshareContext": {"parent": "urn:li:share:9"}})))
            .respond_with(created("urn:li:share:10"))
            .expect(1)
            .mount(&server)
            .await;

        let platform = platform(&server, Some("urn:li:person:abc"));
        platform.like("urn:li:share:9").await.unwrap();
        platform.delete("urn:li:share:9").await.unwrap();
        let reshare = platform.share("urn:li:share:9", Some("+1")).await.unwrap();
        assert_eq!(reshare.id, "urn:li:share:10");
    }
}
