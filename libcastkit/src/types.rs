//! Core types for castkit

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CastError, Result};

/// A social network castkit can talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    X,
    Facebook,
    Instagram,
    LinkedIn,
    Discord,
    YouTube,
    TikTok,
    Threads,
    Telegram,
    WhatsApp,
}

impl Network {
    pub fn all() -> &'static [Network] {
        &[
            Network::X,
            Network::Facebook,
            Network::Instagram,
            Network::LinkedIn,
            Network::Discord,
            Network::YouTube,
            Network::TikTok,
            Network::Threads,
            Network::Telegram,
            Network::WhatsApp,
        ]
    }

    /// Canonical lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::X => "x",
            Network::Facebook => "facebook",
            Network::Instagram => "instagram",
            Network::LinkedIn => "linkedin",
            Network::Discord => "discord",
            Network::YouTube => "youtube",
            Network::TikTok => "tiktok",
            Network::Threads => "threads",
            Network::Telegram => "telegram",
            Network::WhatsApp => "whatsapp",
        }
    }

    /// Networks authenticated with a long-lived bot/system token instead of OAuth
    pub fn uses_static_token(&self) -> bool {
        matches!(self, Network::Discord | Network::Telegram | Network::WhatsApp)
    }

    /// Credential service name used in the keyring and encrypted store
    pub fn credential_service(&self) -> String {
        format!("castkit.{}", self.as_str())
    }

    /// Parse a comma-separated list, rejecting unknown names and dropping duplicates
    pub fn parse_list(input: &str) -> Result<Vec<Network>> {
        let mut networks = Vec::new();
        for part in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let network: Network = part.parse()?;
            if !networks.contains(&network) {
                networks.push(network);
            }
        }
        if networks.is_empty() {
            return Err(CastError::InvalidInput(
                "At least one network must be given".to_string(),
            ));
        }
        Ok(networks)
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "x" | "twitter" => Ok(Network::X),
            "facebook" | "fb" => Ok(Network::Facebook),
            "instagram" | "ig" => Ok(Network::Instagram),
            "linkedin" => Ok(Network::LinkedIn),
            "discord" => Ok(Network::Discord),
            "youtube" | "yt" => Ok(Network::YouTube),
            "tiktok" => Ok(Network::TikTok),
            "threads" => Ok(Network::Threads),
            "telegram" | "tg" => Ok(Network::Telegram),
            "whatsapp" | "wa" => Ok(Network::WhatsApp),
            other => Err(CastError::InvalidInput(format!(
                "Unknown network '{}'. Valid networks: {}",
                other,
                Network::all()
                    .iter()
                    .map(|n| n.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// The uniform action vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Post,
    Like,
    Delete,
    Share,
    Video,
    Schedule,
    Authorize,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Post => "post",
            Action::Like => "like",
            Action::Delete => "delete",
            Action::Share => "share",
            Action::Video => "video",
            Action::Schedule => "schedule",
            Action::Authorize => "authorize",
        }
    }

    /// Actions that operate on an existing post and need its id
    pub fn needs_target(&self) -> bool {
        matches!(self, Action::Like | Action::Delete | Action::Share)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "post" => Ok(Action::Post),
            "like" => Ok(Action::Like),
            "delete" => Ok(Action::Delete),
            "share" => Ok(Action::Share),
            "video" => Ok(Action::Video),
            "schedule" => Ok(Action::Schedule),
            "authorize" => Ok(Action::Authorize),
            other => Err(CastError::InvalidInput(format!(
                "Unknown action '{}'. Valid actions: post, like, delete, share, video, schedule, authorize",
                other
            ))),
        }
    }
}

/// Where a media item comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MediaSource {
    Path(PathBuf),
    Url(String),
}

impl MediaSource {
    /// Parse a CLI argument: http(s) URLs stay remote, everything else is a path
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            MediaSource::Url(input.to_string())
        } else {
            let expanded = shellexpand::tilde(input).to_string();
            MediaSource::Path(PathBuf::from(expanded))
        }
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            MediaSource::Url(url) => Some(url),
            MediaSource::Path(_) => None,
        }
    }
}

impl std::fmt::Display for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaSource::Path(p) => write!(f, "{}", p.display()),
            MediaSource::Url(u) => f.write_str(u),
        }
    }
}

/// Surface a post lands on for networks that distinguish them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    #[default]
    Feed,
    Story,
    Reel,
}

impl FromStr for Placement {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "feed" => Ok(Placement::Feed),
            "story" => Ok(Placement::Story),
            "reel" | "reels" => Ok(Placement::Reel),
            other => Err(CastError::InvalidInput(format!(
                "Unknown placement '{}'. Valid placements: feed, story, reel",
                other
            ))),
        }
    }
}

/// Everything an adapter needs to publish something
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostRequest {
    pub content: String,
    #[serde(default)]
    pub media: Vec<MediaSource>,
    pub link: Option<String>,
    /// Video title (YouTube, TikTok)
    pub title: Option<String>,
    /// Network-specific privacy value (e.g. "public", "unlisted", "SELF_ONLY")
    pub privacy: Option<String>,
    #[serde(default)]
    pub placement: Placement,
    pub reply_to: Option<String>,
    pub scheduled_at: Option<i64>,
}

impl PostRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_media(mut self, source: MediaSource) -> Self {
        self.media.push(source);
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// Content followed by the link, for networks without a link field
    pub fn text_with_link(&self) -> String {
        match &self.link {
            Some(link) if !self.content.contains(link.as_str()) => {
                if self.content.is_empty() {
                    link.clone()
                } else {
                    format!("{} {}", self.content, link)
                }
            }
            _ => self.content.clone(),
        }
    }
}

/// Normalized result of a successful network call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostOutcome {
    pub network: Network,
    /// Platform id of the created/affected object
    pub id: String,
    pub url: Option<String>,
    /// The platform's response body, kept for `--format json`
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl PostOutcome {
    pub fn new(network: Network, id: impl Into<String>) -> Self {
        Self {
            network,
            id: id.into(),
            url: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Lifecycle of a recorded action
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Scheduled,
    Posted,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Scheduled => "scheduled",
            ActionStatus::Posted => "posted",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scheduled" => ActionStatus::Scheduled,
            "posted" => ActionStatus::Posted,
            "failed" => ActionStatus::Failed,
            "cancelled" => ActionStatus::Cancelled,
            _ => ActionStatus::Pending,
        }
    }
}

/// One invocation of an action, across however many networks it targeted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEntry {
    pub id: String,
    pub action: Action,
    pub content: String,
    /// Target post id for like/delete/share
    pub target: Option<String>,
    pub created_at: i64,
    pub scheduled_at: Option<i64>,
    pub status: ActionStatus,
    pub metadata: Option<String>,
}

impl ActionEntry {
    pub fn new(action: Action, content: String, target: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            content,
            target,
            created_at: chrono::Utc::now().timestamp(),
            scheduled_at: None,
            status: ActionStatus::Pending,
            metadata: None,
        }
    }
}

/// Per-network outcome of an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Option<i64>,
    pub action_id: String,
    pub network: String,
    pub platform_id: Option<String>,
    pub url: Option<String>,
    pub completed_at: Option<i64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub account_name: String,
}

/// A request waiting in the local schedule queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedPost {
    pub id: String,
    pub request: PostRequest,
    pub networks: Vec<Network>,
    pub due_at: i64,
    pub attempts: u32,
    pub account: Option<String>,
}
