//! Error types for castkit

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CastError>;

#[derive(Error, Debug)]
pub enum CastError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CastError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CastError::InvalidInput(_) => 3,
            CastError::Platform(PlatformError::Authentication(_)) => 2,
            CastError::Auth(_) => 2,
            _ => 1,
        }
    }

    /// Whether a retry of the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CastError::Platform(PlatformError::Network(_))
                | CastError::Platform(PlatformError::RateLimit(_))
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Network '{0}' is not configured")]
    NetworkNotConfigured(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content validation failed: {0}")]
    Validation(String),

    #[error("Posting failed: {0}")]
    Posting(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not supported: {0}")]
    NotImplemented(String),
}

impl PlatformError {
    /// Map an HTTP failure from a network API onto a platform error
    ///
    /// `context` names the operation that failed (e.g. "post", "upload media").
    /// The response body is truncated so that a full HTML error page never ends
    /// up in a log line.
    pub fn from_status(network: &str, context: &str, status: u16, body: &str) -> Self {
        let body = truncate(body.trim(), 300);
        match status {
            401 | 403 => PlatformError::Authentication(format!(
                "{} rejected credentials during {} (HTTP {}): {}. \
                 Suggestion: run 'cast-auth authorize {}' or 'cast-auth set {}'.",
                network, context, status, body, network, network
            )),
            400 | 422 => PlatformError::Validation(format!(
                "{} rejected the request during {} (HTTP {}): {}",
                network, context, status, body
            )),
            404 => PlatformError::NotFound(format!(
                "{} could not find the target of {} (HTTP 404): {}",
                network, context, body
            )),
            429 => PlatformError::RateLimit(format!(
                "{} rate limit hit during {}: {}",
                network, context, body
            )),
            500..=599 => PlatformError::Network(format!(
                "{} server error during {} (HTTP {}): {}",
                network, context, status, body
            )),
            _ => PlatformError::Posting(format!(
                "{} {} failed (HTTP {}): {}",
                network, context, status, body
            )),
        }
    }

    /// Wrap a transport-level failure (connect, timeout, decode)
    pub fn transport(network: &str, context: &str, error: impl std::fmt::Display) -> Self {
        PlatformError::Network(format!("{} {} failed: {}", network, context, error))
    }

    /// Construct the error returned by operations a network does not offer
    pub fn unsupported(network: &str, operation: &str) -> Self {
        PlatformError::NotImplemented(format!("{} does not support {}", network, operation))
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("OS keyring unavailable: {0}")]
    KeyringUnavailable(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed: wrong master password or corrupted file")]
    DecryptionFailed,

    #[error("Master password not set")]
    MasterPasswordNotSet,

    #[error("Master password must be at least 8 characters")]
    WeakPassword,

    #[error("No credential storage backend available")]
    NoStoreAvailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("{0} has no stored token. Run 'cast-auth authorize {0}'")]
    NotAuthorized(String),

    #[error("{0} token expired and cannot be refreshed. Run 'cast-auth authorize {0}'")]
    Expired(String),

    #[error("Token refresh failed for {0}: {1}")]
    RefreshFailed(String, String),

    #[error("Token exchange failed for {0}: {1}")]
    ExchangeFailed(String, String),

    #[error("Authorization was denied: {0}")]
    Denied(String),

    #[error("OAuth state mismatch (possible CSRF); aborting")]
    StateMismatch,

    #[error("Timed out after {0}s waiting for the authorization callback")]
    CallbackTimeout(u64),

    #[error("Callback server error: {0}")]
    Callback(String),

    #[error("{0} uses a static token; store it with 'cast-auth set {0}'")]
    StaticTokenNetwork(String),

    #[error("Signing error: {0}")]
    Signing(String),
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media file not found: {0}")]
    NotFound(String),

    #[error("Unsupported media type for {0}")]
    UnsupportedType(String),

    #[error("Media too large: {size} bytes exceeds {limit} byte limit for {name}")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("Too many media items: {count} (max {max})")]
    TooMany { count: usize, max: usize },

    #[error("Media download failed: {0}")]
    Download(String),

    #[error("Downloaded media is empty: {0}")]
    Empty(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed {0}: {1}")]
    Fetch(String, String),

    #[error("Failed to parse feed {0}: {1}")]
    Parse(String, String),

    #[error("Feed {0} has no items to post")]
    Empty(String),
}

#[derive(Error, Debug)]
pub enum AccountError {
    #[error("Invalid account name: {0}")]
    InvalidName(String),

    #[error("Account name '{0}' is reserved")]
    ReservedName(String),

    #[error("Account '{0}' not found for network '{1}'")]
    NotFound(String, String),

    #[error("Account state file error: {0}")]
    StateFile(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = CastError::InvalidInput("Empty content".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication() {
        let error = CastError::Platform(PlatformError::Authentication("bad token".to_string()));
        assert_eq!(error.exit_code(), 2);

        let error = CastError::Auth(AuthError::NotAuthorized("linkedin".to_string()));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let cases = vec![
            CastError::Platform(PlatformError::Posting("x".to_string())),
            CastError::Platform(PlatformError::Network("x".to_string())),
            CastError::Platform(PlatformError::RateLimit("x".to_string())),
            CastError::Config(ConfigError::MissingField("database.path".to_string())),
            CastError::Media(MediaError::NotFound("a.png".to_string())),
            CastError::Feed(FeedError::Empty("https://example.com/rss".to_string())),
        ];
        for error in cases {
            assert_eq!(error.exit_code(), 1, "unexpected exit code for {}", error);
        }
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            PlatformError::from_status("x", "post", 401, ""),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(
            PlatformError::from_status("x", "post", 403, ""),
            PlatformError::Authentication(_)
        ));
        assert!(matches!(
            PlatformError::from_status("x", "post", 422, ""),
            PlatformError::Validation(_)
        ));
        assert!(matches!(
            PlatformError::from_status("x", "delete", 404, ""),
            PlatformError::NotFound(_)
        ));
        assert!(matches!(
            PlatformError::from_status("x", "post", 429, ""),
            PlatformError::RateLimit(_)
        ));
        assert!(matches!(
            PlatformError::from_status("x", "post", 503, ""),
            PlatformError::Network(_)
        ));
        assert!(matches!(
            PlatformError::from_status("x", "post", 409, ""),
            PlatformError::Posting(_)
        ));
    }

    #[test]
    fn test_from_status_message_names_network_and_operation() {
        let err = PlatformError::from_status("linkedin", "upload image", 500, "oops");
        let message = err.to_string();
        assert!(message.contains("linkedin"));
        assert!(message.contains("upload image"));
        assert!(message.contains("oops"));
    }

    #[test]
    fn test_from_status_truncates_long_bodies() {
        let body = "a".repeat(5000);
        let message = PlatformError::from_status("facebook", "post", 500, &body).to_string();
        assert!(message.len() < 1000);
        assert!(message.ends_with('…'));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CastError::from(PlatformError::Network("t".into())).is_transient());
        assert!(CastError::from(PlatformError::RateLimit("t".into())).is_transient());
        assert!(!CastError::from(PlatformError::Validation("t".into())).is_transient());
        assert!(!CastError::from(PlatformError::Authentication("t".into())).is_transient());
        assert!(!CastError::InvalidInput("t".into()).is_transient());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = CastError::Platform(PlatformError::Authentication("Bot token missing".into()));
        assert_eq!(
            error.to_string(),
            "Platform error: Authentication failed: Bot token missing"
        );

        let error = CastError::Auth(AuthError::Expired("youtube".into()));
        assert!(error.to_string().contains("cast-auth authorize youtube"));
    }

    #[test]
    fn test_unsupported_message() {
        let err = PlatformError::unsupported("instagram", "like");
        assert_eq!(err.to_string(), "Not supported: instagram does not support like");
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original.to_string(), cloned.to_string());
    }
}
