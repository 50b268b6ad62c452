//! Media loading and validation
//!
//! Remote media is streamed into a named temp file that is removed when the
//! [`MediaFile`] is dropped. Local files are only inspected, never copied.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::error::{MediaError, PlatformError, Result};
use crate::http::HttpClient;
use crate::types::MediaSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Jpeg,
    Png,
    Gif,
    WebP,
    Mp4,
    Mov,
    WebM,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Jpeg => "image/jpeg",
            MimeType::Png => "image/png",
            MimeType::Gif => "image/gif",
            MimeType::WebP => "image/webp",
            MimeType::Mp4 => "video/mp4",
            MimeType::Mov => "video/quicktime",
            MimeType::WebM => "video/webm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MimeType::Jpeg => "jpg",
            MimeType::Png => "png",
            MimeType::Gif => "gif",
            MimeType::WebP => "webp",
            MimeType::Mp4 => "mp4",
            MimeType::Mov => "mov",
            MimeType::WebM => "webm",
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MimeType::Jpeg | MimeType::Png | MimeType::Gif | MimeType::WebP => MediaKind::Image,
            MimeType::Mp4 | MimeType::Mov | MimeType::WebM => MediaKind::Video,
        }
    }

    /// Sniff the container format from the first bytes of a file
    pub fn from_magic(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(MimeType::Jpeg);
        }
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Some(MimeType::Png);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(MimeType::Gif);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(MimeType::WebP);
        }
        if bytes.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            return Some(MimeType::WebM);
        }
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            return Some(if &bytes[8..12] == b"qt  " {
                MimeType::Mov
            } else {
                MimeType::Mp4
            });
        }
        None
    }

    /// Parse a Content-Type header value, ignoring parameters
    pub fn from_content_type(value: &str) -> Option<Self> {
        let essence = value.split(';').next()?.trim().to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Some(MimeType::Jpeg),
            "image/png" => Some(MimeType::Png),
            "image/gif" => Some(MimeType::Gif),
            "image/webp" => Some(MimeType::WebP),
            "video/mp4" => Some(MimeType::Mp4),
            "video/quicktime" => Some(MimeType::Mov),
            "video/webm" => Some(MimeType::WebM),
            _ => None,
        }
    }

    /// Guess from a path or URL path extension
    pub fn from_extension(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next()?;
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(MimeType::Jpeg),
            "png" => Some(MimeType::Png),
            "gif" => Some(MimeType::Gif),
            "webp" => Some(MimeType::WebP),
            "mp4" | "m4v" => Some(MimeType::Mp4),
            "mov" => Some(MimeType::Mov),
            "webm" => Some(MimeType::WebM),
            _ => None,
        }
    }
}

impl std::fmt::Display for MimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a network accepts
#[derive(Debug, Clone)]
pub struct MediaLimits {
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub max_items: usize,
    pub image_types: Vec<MimeType>,
    pub video_types: Vec<MimeType>,
}

const MB: u64 = 1024 * 1024;

impl MediaLimits {
    pub fn new(max_image_mb: u64, max_video_mb: u64, max_items: usize) -> Self {
        Self {
            max_image_bytes: max_image_mb * MB,
            max_video_bytes: max_video_mb * MB,
            max_items,
            image_types: vec![MimeType::Jpeg, MimeType::Png, MimeType::Gif, MimeType::WebP],
            video_types: vec![MimeType::Mp4, MimeType::Mov],
        }
    }

    pub fn with_image_types(mut self, types: &[MimeType]) -> Self {
        self.image_types = types.to_vec();
        self
    }

    pub fn with_video_types(mut self, types: &[MimeType]) -> Self {
        self.video_types = types.to_vec();
        self
    }

    /// For networks that take no media at all
    pub fn none() -> Self {
        Self {
            max_image_bytes: 0,
            max_video_bytes: 0,
            max_items: 0,
            image_types: Vec::new(),
            video_types: Vec::new(),
        }
    }

    pub fn accepts(&self, mime: MimeType) -> bool {
        match mime.kind() {
            MediaKind::Image => self.image_types.contains(&mime),
            MediaKind::Video => self.video_types.contains(&mime),
        }
    }

    /// Upper bound over every media kind
    pub fn largest(&self) -> u64 {
        self.max_image_bytes.max(self.max_video_bytes)
    }

    pub fn max_bytes(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
        }
    }
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self::new(5, 512, 4)
    }
}

/// A media item on local disk, ready to upload
#[derive(Debug)]
pub struct MediaFile {
    pub path: PathBuf,
    pub mime: MimeType,
    pub size: u64,
    pub source_url: Option<String>,
    temp: Option<TempPath>,
}

impl MediaFile {
    pub fn kind(&self) -> MediaKind {
        self.mime.kind()
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// File name to present in multipart uploads
    pub fn file_name(&self) -> String {
        match self.path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !self.is_temporary() => name.to_string(),
            _ => format!("upload.{}", self.mime.extension()),
        }
    }

    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await.map_err(MediaError::Io)?)
    }

    /// Read `len` bytes at `offset`; shorter at end of file
    pub async fn read_chunk(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let mut file = tokio::fs::File::open(&self.path).await.map_err(MediaError::Io)?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(MediaError::Io)?;
        let mut buf = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(MediaError::Io)?;
        Ok(buf)
    }

    /// Delete the temp file now instead of on drop; local files are untouched
    pub fn cleanup(mut self) -> Result<()> {
        if let Some(temp) = self.temp.take() {
            temp.close().map_err(MediaError::Io)?;
        }
        Ok(())
    }
}

pub struct MediaFactory {
    http: HttpClient,
}

impl MediaFactory {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn load(&self, source: &MediaSource) -> Result<MediaFile> {
        self.load_within(source, None).await
    }

    /// Like [`load`](Self::load), but a download stops once it passes `max_bytes`
    async fn load_within(&self, source: &MediaSource, max_bytes: Option<u64>) -> Result<MediaFile> {
        match source {
            MediaSource::Path(path) => Self::load_local(path).await,
            MediaSource::Url(url) => self.download(url, max_bytes).await,
        }
    }

    async fn load_local(path: &Path) -> Result<MediaFile> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| MediaError::NotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(MediaError::NotFound(path.display().to_string()).into());
        }
        if metadata.len() == 0 {
            return Err(MediaError::Empty(path.display().to_string()).into());
        }

        let mut head = [0u8; 16];
        let read = {
            use tokio::io::AsyncReadExt;
            let mut file = tokio::fs::File::open(path).await.map_err(MediaError::Io)?;
            file.read(&mut head).await.map_err(MediaError::Io)?
        };

        let mime = MimeType::from_magic(&head[..read])
            .or_else(|| MimeType::from_extension(&path.to_string_lossy()))
            .ok_or_else(|| MediaError::UnsupportedType(path.display().to_string()))?;

        Ok(MediaFile {
            path: path.to_path_buf(),
            mime,
            size: metadata.len(),
            source_url: None,
            temp: None,
        })
    }

    /// Stream a URL into a temp file, sniffing the type from the first bytes
    async fn download(&self, url: &str, max_bytes: Option<u64>) -> Result<MediaFile> {
        let response = self
            .http
            .inner()
            .get(url)
            .send()
            .await
            .map_err(|e| MediaError::Download(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(MediaError::Download(format!("{}: HTTP {}", url, response.status())).into());
        }
        let too_large = |size: u64, limit: u64| MediaError::TooLarge {
            name: url.to_string(),
            size,
            limit,
        };
        if let (Some(limit), Some(length)) = (max_bytes, response.content_length()) {
            if length > limit {
                return Err(too_large(length, limit).into());
            }
        }

        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(MimeType::from_content_type);
        let ext_mime = MimeType::from_extension(url);
        let suffix = header_mime
            .or(ext_mime)
            .map(|m| format!(".{}", m.extension()))
            .unwrap_or_default();

        let temp = tempfile::Builder::new()
            .prefix("castkit-")
            .suffix(&suffix)
            .tempfile()
            .map_err(MediaError::Io)?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let mut head: Vec<u8> = Vec::with_capacity(16);
        let mut size: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MediaError::Download(format!("{}: {}", url, e)))?;
            if head.len() < 16 {
                let take = (16 - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            size += chunk.len() as u64;
            if let Some(limit) = max_bytes.filter(|limit| size > *limit) {
                return Err(too_large(size, limit).into());
            }
            file.write_all(&chunk).await.map_err(MediaError::Io)?;
        }
        file.flush().await.map_err(MediaError::Io)?;

        if size == 0 {
            return Err(MediaError::Empty(url.to_string()).into());
        }

        let mime = MimeType::from_magic(&head)
            .or(header_mime)
            .or(ext_mime)
            .ok_or_else(|| MediaError::UnsupportedType(url.to_string()))?;

        tracing::debug!(url, size, mime = %mime, "downloaded media to {}", temp_path.display());
        Ok(MediaFile {
            path: temp_path.to_path_buf(),
            mime,
            size,
            source_url: Some(url.to_string()),
            temp: Some(temp_path),
        })
    }

    pub fn validate(file: &MediaFile, limits: &MediaLimits) -> Result<()> {
        let name = file
            .source_url
            .clone()
            .unwrap_or_else(|| file.path.display().to_string());
        if !limits.accepts(file.mime) {
            return Err(MediaError::UnsupportedType(format!("{} ({})", name, file.mime)).into());
        }
        let limit = limits.max_bytes(file.kind());
        if file.size > limit {
            return Err(MediaError::TooLarge {
                name,
                size: file.size,
                limit,
            }
            .into());
        }
        Ok(())
    }

    /// Load and validate every source, checking the item count first
    pub async fn load_all(&self, sources: &[MediaSource], limits: &MediaLimits) -> Result<Vec<MediaFile>> {
        if sources.len() > limits.max_items {
            return Err(MediaError::TooMany {
                count: sources.len(),
                max: limits.max_items,
            }
            .into());
        }
        let mut files = Vec::with_capacity(sources.len());
        for source in sources {
            let file = self.load_within(source, Some(limits.largest())).await?;
            Self::validate(&file, limits)?;
            files.push(file);
        }
        Ok(files)
    }
}

/// Require a public URL (Instagram, Threads and TikTok pull media themselves)
pub fn require_url<'a>(network: &str, source: &'a MediaSource) -> std::result::Result<&'a str, PlatformError> {
    source.as_url().ok_or_else(|| {
        PlatformError::Validation(format!(
            "{} fetches media itself; '{}' must be a public http(s) URL",
            network, source
        ))
    })
}

/// Media kind of a remote URL judged by its extension; unknown counts as an image
pub fn guess_kind(url: &str) -> MediaKind {
    MimeType::from_extension(url)
        .map(|m| m.kind())
        .unwrap_or(MediaKind::Image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

    fn mp4_header() -> Vec<u8> {
        let mut bytes = vec![0, 0, 0, 0x18];
        bytes.extend_from_slice(b"ftypisom");
        bytes.extend_from_slice(&[0; 32]);
        bytes
    }

    #[test]
    fn test_magic_detection() {
        assert_eq!(MimeType::from_magic(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(MimeType::Jpeg));
        assert_eq!(MimeType::from_magic(PNG), Some(MimeType::Png));
        assert_eq!(MimeType::from_magic(b"GIF89a...."), Some(MimeType::Gif));
        assert_eq!(MimeType::from_magic(b"RIFF\0\0\0\0WEBPVP8 "), Some(MimeType::WebP));
        assert_eq!(MimeType::from_magic(&mp4_header()), Some(MimeType::Mp4));
        assert_eq!(
            MimeType::from_magic(b"\0\0\0\x14ftypqt  \0\0\0\0"),
            Some(MimeType::Mov)
        );
        assert_eq!(MimeType::from_magic(&[0x1A, 0x45, 0xDF, 0xA3, 1]), Some(MimeType::WebM));
        assert_eq!(MimeType::from_magic(b"%PDF-1.7"), None);
    }

    #[test]
    fn test_content_type_and_extension() {
        assert_eq!(
            MimeType::from_content_type("image/JPEG; charset=binary"),
            Some(MimeType::Jpeg)
        );
        assert_eq!(MimeType::from_content_type("text/html"), None);
        assert_eq!(
            MimeType::from_extension("https://cdn.example.com/a/clip.MOV?sig=1"),
            Some(MimeType::Mov)
        );
        assert_eq!(MimeType::from_extension("/tmp/noext"), None);
    }

    #[tokio::test]
    async fn test_load_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.bin");
        std::fs::write(&path, PNG).unwrap();

        let factory = MediaFactory::new(HttpClient::new().unwrap());
        let file = factory.load(&MediaSource::Path(path.clone())).await.unwrap();
        assert_eq!(file.mime, MimeType::Png);
        assert_eq!(file.size, PNG.len() as u64);
        assert!(!file.is_temporary());
        assert_eq!(file.file_name(), "photo.bin");

        file.cleanup().unwrap();
        assert!(path.exists(), "local files must never be deleted");
    }

    #[tokio::test]
    async fn test_load_missing_and_empty() {
        let dir = TempDir::new().unwrap();
        let factory = MediaFactory::new(HttpClient::new().unwrap());

        let missing = factory
            .load(&MediaSource::Path(dir.path().join("nope.png")))
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("not found"));

        let empty = dir.path().join("empty.png");
        std::fs::write(&empty, b"").unwrap();
        assert!(factory.load(&MediaSource::Path(empty)).await.is_err());
    }

    #[tokio::test]
    async fn test_download_creates_and_removes_temp_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(mp4_header()),
            )
            .mount(&server)
            .await;

        let factory = MediaFactory::new(HttpClient::new().unwrap());
        let url = format!("{}/clip", server.uri());
        let file = factory.load(&MediaSource::Url(url.clone())).await.unwrap();
        assert_eq!(file.mime, MimeType::Mp4);
        assert_eq!(file.kind(), MediaKind::Video);
        assert_eq!(file.source_url.as_deref(), Some(url.as_str()));
        assert_eq!(file.file_name(), "upload.mp4");

        let path = file.path.clone();
        assert!(path.exists());
        assert_eq!(file.read_chunk(4, 4).await.unwrap(), b"ftyp");
        drop(file);
        assert!(!path.exists(), "temp file should be removed on drop");
    }

    #[tokio::test]
    async fn test_download_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let factory = MediaFactory::new(HttpClient::new().unwrap());
        let gone = factory
            .load(&MediaSource::Url(format!("{}/gone", server.uri())))
            .await
            .unwrap_err();
        assert!(gone.to_string().contains("404"));

        let page = factory
            .load(&MediaSource::Url(format!("{}/page", server.uri())))
            .await
            .unwrap_err();
        assert!(page.to_string().contains("Unsupported media type"));
    }

    #[tokio::test]
    async fn test_oversized_download_is_rejected() {
        let server = MockServer::start().await;
        let mut body = mp4_header();
        body.resize(2 * 1024 * 1024, 0);
        Mock::given(method("GET"))
            .and(path("/huge.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let factory = MediaFactory::new(HttpClient::new().unwrap());
        let sources = vec![MediaSource::Url(format!("{}/huge.mp4", server.uri()))];
        let err = factory
            .load_all(&sources, &MediaLimits::new(1, 1, 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Media too large"));
        assert!(err.to_string().contains("1048576 byte limit"));
    }

    #[tokio::test]
    async fn test_validate_type_size_and_count() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, PNG).unwrap();
        let factory = MediaFactory::new(HttpClient::new().unwrap());
        let file = factory.load(&MediaSource::Path(path.clone())).await.unwrap();

        assert!(MediaFactory::validate(&file, &MediaLimits::default()).is_ok());

        let jpeg_only = MediaLimits::default().with_image_types(&[MimeType::Jpeg]);
        assert!(MediaFactory::validate(&file, &jpeg_only).is_err());

        let mut tiny = MediaLimits::default();
        tiny.max_image_bytes = 4;
        let err = MediaFactory::validate(&file, &tiny).unwrap_err();
        assert!(err.to_string().contains("exceeds 4 byte limit"));

        let sources = vec![MediaSource::Path(path.clone()), MediaSource::Path(path)];
        let one = MediaLimits::new(5, 5, 1);
        let err = factory.load_all(&sources, &one).await.unwrap_err();
        assert!(err.to_string().contains("max 1"));
    }

    #[test]
    fn test_require_url() {
        let url = MediaSource::Url("https://example.com/a.jpg".to_string());
        assert_eq!(require_url("instagram", &url).unwrap(), "https://example.com/a.jpg");
        let local = MediaSource::Path(PathBuf::from("/tmp/a.jpg"));
        assert!(matches!(
            require_url("instagram", &local),
            Err(PlatformError::Validation(_))
        ));
    }

    #[test]
    fn test_guess_kind() {
        assert_eq!(guess_kind("https://cdn.example.com/clip.MP4?sig=1"), MediaKind::Video);
        assert_eq!(guess_kind("https://cdn.example.com/photo.png"), MediaKind::Image);
        assert_eq!(guess_kind("https://cdn.example.com/render"), MediaKind::Image);
    }
}
