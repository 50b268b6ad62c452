//! Configuration management for castkit
//!
//! The config file is TOML. Every section is optional; a missing file yields
//! the defaults so that `cast-auth init` can be the first thing a user runs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::CredentialConfig;
use crate::error::{ConfigError, Result};
use crate::types::Network;

pub const ENV_CONFIG: &str = "CASTKIT_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub credentials: Option<CredentialConfig>,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub auth: AuthConfig,

    pub x: Option<XConfig>,
    pub facebook: Option<FacebookConfig>,
    pub instagram: Option<InstagramConfig>,
    pub linkedin: Option<LinkedInConfig>,
    pub discord: Option<DiscordConfig>,
    pub youtube: Option<YouTubeConfig>,
    pub tiktok: Option<TikTokConfig>,
    pub threads: Option<ThreadsConfig>,
    pub telegram: Option<TelegramConfig>,
    pub whatsapp: Option<WhatsAppConfig>,

    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/castkit/history.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn expand_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Networks used when `--network` is omitted
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            retry_attempts: default_retry_attempts(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum spacing between two calls of the same operation
    #[serde(default = "default_min_interval")]
    pub min_interval_ms: u64,
    /// Hourly post quota per network, enforced by cast-send
    #[serde(default)]
    pub posts_per_hour: HashMap<String, u32>,
}

fn default_min_interval() -> u64 {
    1000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval(),
            posts_per_hour: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
}

fn default_callback_port() -> u16 {
    8765
}

fn default_callback_timeout() -> u64 {
    300
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            callback_port: default_callback_port(),
            callback_timeout_secs: default_callback_timeout(),
        }
    }
}

impl AuthConfig {
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.callback_port)
    }
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// OAuth1 consumer key
    pub api_key: String,
    pub api_secret: String,
    pub api_base: Option<String>,
    pub upload_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacebookConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub page_id: String,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub api_base: Option<String>,
    pub video_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstagramConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Instagram business account id
    pub user_id: String,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedInConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    /// `urn:li:person:…` or `urn:li:organization:…`; resolved via userinfo when absent
    pub author_urn: Option<String>,
    #[serde(default = "default_linkedin_version")]
    pub api_version: String,
    pub api_base: Option<String>,
}

fn default_linkedin_version() -> String {
    "202405".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub channel_id: String,
    #[serde(default = "default_reaction")]
    pub reaction: String,
    pub api_base: Option<String>,
}

fn default_reaction() -> String {
    "👍".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YouTubeConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default = "default_youtube_privacy")]
    pub privacy: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub api_base: Option<String>,
    pub upload_base: Option<String>,
}

fn default_category() -> String {
    "22".to_string()
}

fn default_youtube_privacy() -> String {
    "private".to_string()
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TikTokConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub client_key: String,
    pub client_secret: String,
    #[serde(default = "default_tiktok_privacy")]
    pub privacy_level: String,
    pub api_base: Option<String>,
}

fn default_tiktok_privacy() -> String {
    "SELF_ONLY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub user_id: String,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Numeric chat id or `@channelname`
    pub chat_id: String,
    #[serde(default = "default_reaction")]
    pub reaction: String,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub phone_number_id: String,
    /// Destination phone number in international format
    pub recipient: String,
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub networks: Vec<String>,
    pub template: Option<String>,
    /// humantime duration such as `24h`
    pub max_age: Option<String>,
}

const STARTER_CONFIG: &str = r#"# castkit configuration

[database]
path = "~/.local/share/castkit/history.db"

[credentials]
# "keyring" (OS keychain) or "encrypted" (age files, needs CASTKIT_MASTER_PASSWORD)
storage = "keyring"
path = "~/.config/castkit/credentials"

[defaults]
networks = []
retry_attempts = 3
request_timeout_secs = 30

[rate_limits]
min_interval_ms = 1000
# posts_per_hour = { x = 50, telegram = 200 }

[auth]
callback_port = 8765
callback_timeout_secs = 300

# Uncomment the networks you use. Tokens are stored with `cast-auth`.

# [x]
# api_key = ""
# api_secret = ""

# [facebook]
# page_id = ""
# app_id = ""
# app_secret = ""

# [instagram]
# user_id = ""

# [linkedin]
# client_id = ""
# client_secret = ""

# [discord]
# channel_id = ""

# [youtube]
# client_id = ""
# client_secret = ""
# privacy = "private"

# [tiktok]
# client_key = ""
# client_secret = ""

# [threads]
# user_id = ""

# [telegram]
# chat_id = "@mychannel"

# [whatsapp]
# phone_number_id = ""
# recipient = ""

# [[feeds]]
# name = "blog"
# url = "https://example.com/feed.xml"
# networks = ["x", "linkedin"]
# template = "{title} {link}"
# max_age = "24h"
"#;

impl Config {
    /// Load from `CASTKIT_CONFIG` or the XDG location; a missing file yields defaults
    pub fn load() -> Result<Self> {
        let path = resolve_config_path()?;
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default_config());
        }
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self {
            credentials: Some(CredentialConfig::default()),
            ..Default::default()
        }
    }

    /// Commented starter file written by `cast-auth init`
    pub fn starter_toml() -> &'static str {
        STARTER_CONFIG
    }

    /// Write the starter file, refusing to clobber an existing one
    pub fn write_starter(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(crate::error::CastError::InvalidInput(format!(
                "Config file already exists at {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::ReadError)?;
        }
        std::fs::write(path, STARTER_CONFIG).map_err(ConfigError::ReadError)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for network in &self.defaults.networks {
            network.parse::<Network>()?;
        }
        for network in self.rate_limits.posts_per_hour.keys() {
            network.parse::<Network>()?;
        }
        if let Some(yt) = &self.youtube {
            if yt.chunk_size == 0 || yt.chunk_size % (256 * 1024) != 0 {
                return Err(crate::error::CastError::InvalidInput(format!(
                    "youtube.chunk_size must be a positive multiple of 262144, got {}",
                    yt.chunk_size
                )));
            }
        }
        for feed in &self.feeds {
            if feed.url.is_empty() {
                return Err(ConfigError::MissingField(format!("feeds.{}.url", feed.name)).into());
            }
            if let Some(max_age) = &feed.max_age {
                humantime::parse_duration(max_age).map_err(|e| {
                    crate::error::CastError::InvalidInput(format!(
                        "feeds.{}.max_age '{}': {}",
                        feed.name, max_age, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Whether a section exists for the network and is enabled
    pub fn is_enabled(&self, network: Network) -> bool {
        match network {
            Network::X => self.x.as_ref().map(|c| c.enabled),
            Network::Facebook => self.facebook.as_ref().map(|c| c.enabled),
            Network::Instagram => self.instagram.as_ref().map(|c| c.enabled),
            Network::LinkedIn => self.linkedin.as_ref().map(|c| c.enabled),
            Network::Discord => self.discord.as_ref().map(|c| c.enabled),
            Network::YouTube => self.youtube.as_ref().map(|c| c.enabled),
            Network::TikTok => self.tiktok.as_ref().map(|c| c.enabled),
            Network::Threads => self.threads.as_ref().map(|c| c.enabled),
            Network::Telegram => self.telegram.as_ref().map(|c| c.enabled),
            Network::WhatsApp => self.whatsapp.as_ref().map(|c| c.enabled),
        }
        .unwrap_or(false)
    }

    pub fn enabled_networks(&self) -> Vec<Network> {
        Network::all()
            .iter()
            .copied()
            .filter(|n| self.is_enabled(*n))
            .collect()
    }

    /// `[defaults] networks`, or every enabled network when that list is empty
    pub fn default_networks(&self) -> Result<Vec<Network>> {
        if self.defaults.networks.is_empty() {
            return Ok(self.enabled_networks());
        }
        Network::parse_list(&self.defaults.networks.join(","))
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.name == name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.request_timeout_secs)
    }

    pub fn credential_config(&self) -> CredentialConfig {
        let mut config = self.credentials.clone().unwrap_or_default();
        config.load_master_password_from_env();
        config
    }
}

/// Resolve the configuration file path following the XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("castkit").join("config.toml"))
}

/// Directory holding `accounts.toml` and other per-user state
pub fn resolve_state_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        let expanded = PathBuf::from(shellexpand::tilde(&path).to_string());
        if let Some(parent) = expanded.parent() {
            return Ok(parent.to_path_buf());
        }
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;
    Ok(config_dir.join("castkit"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.defaults.retry_attempts, 3);
        assert_eq!(config.defaults.request_timeout_secs, 30);
        assert_eq!(config.rate_limits.min_interval_ms, 1000);
        assert_eq!(config.auth.callback_port, 8765);
        assert!(config.enabled_networks().is_empty());
    }

    #[test]
    fn test_starter_config_parses() {
        let config = Config::parse(Config::starter_toml()).unwrap();
        assert!(config.credentials.is_some());
        assert!(config.x.is_none());
    }

    #[test]
    fn test_network_sections() {
        let toml = r#"
            [x]
            api_key = "ck"
            api_secret = "cs"

            [telegram]
            chat_id = "@castkit"
            enabled = false

            [youtube]
            client_id = "id"
            client_secret = "secret"
        "#;
        let config = Config::parse(toml).unwrap();
        assert!(config.is_enabled(Network::X));
        assert!(!config.is_enabled(Network::Telegram));
        assert!(config.is_enabled(Network::YouTube));
        assert_eq!(config.enabled_networks(), vec![Network::X, Network::YouTube]);

        let yt = config.youtube.unwrap();
        assert_eq!(yt.chunk_size, 8 * 1024 * 1024);
        assert_eq!(yt.max_retries, 10);
        assert_eq!(config.telegram.unwrap().reaction, "👍");
    }

    #[test]
    fn test_default_networks_prefers_explicit_list() {
        let toml = r#"
            [defaults]
            networks = ["twitter", "linkedin"]

            [discord]
            channel_id = "1"
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(
            config.default_networks().unwrap(),
            vec![Network::X, Network::LinkedIn]
        );
    }

    #[test]
    fn test_unknown_default_network_is_rejected() {
        let toml = r#"
            [defaults]
            networks = ["friendster"]
        "#;
        assert!(Config::parse(toml).is_err());
    }

    #[test]
    fn test_bad_chunk_size_is_rejected() {
        let toml = r#"
            [youtube]
            client_id = "id"
            client_secret = "secret"
            chunk_size = 1000
        "#;
        let err = Config::parse(toml).unwrap_err();
        assert!(err.to_string().contains("262144"));
    }

    #[test]
    fn test_feed_lookup_and_max_age_validation() {
        let toml = r#"
            [[feeds]]
            name = "blog"
            url = "https://example.com/rss"
            networks = ["x"]
            max_age = "24h"
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.feed("blog").unwrap().url, "https://example.com/rss");
        assert!(config.feed("other").is_none());

        let bad = r#"
            [[feeds]]
            name = "blog"
            url = "https://example.com/rss"
            max_age = "yesterday-ish"
        "#;
        assert!(Config::parse(bad).is_err());
    }

    #[test]
    fn test_write_starter_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("castkit").join("config.toml");
        Config::write_starter(&path).unwrap();
        assert!(path.exists());
        assert!(Config::write_starter(&path).is_err());
        assert!(Config::load_from_path(&path).is_ok());
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_env_override() {
        std::env::set_var(ENV_CONFIG, "/tmp/castkit-test/config.toml");
        assert_eq!(
            resolve_config_path().unwrap(),
            PathBuf::from("/tmp/castkit-test/config.toml")
        );
        assert_eq!(resolve_state_dir().unwrap(), PathBuf::from("/tmp/castkit-test"));
        std::env::remove_var(ENV_CONFIG);
    }

    #[test]
    #[serial]
    fn test_load_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        std::env::set_var(ENV_CONFIG, temp.path().join("missing.toml"));
        let config = Config::load().unwrap();
        assert_eq!(config.defaults.retry_attempts, 3);
        std::env::remove_var(ENV_CONFIG);
    }
}
