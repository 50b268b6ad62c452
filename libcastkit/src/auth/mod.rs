//! Authorization: token model, request signing and the interactive OAuth flows
//!
//! - [`oauth1`]: HMAC-SHA1 request signing (X)
//! - [`oauth2`]: authorization code flow with PKCE and per-network quirks
//! - [`callback`]: one-shot local HTTP server receiving the redirect
//! - [`token_store`]: tokens persisted through the credential manager
//! - [`manager`]: ties the above together for the CLI

pub mod callback;
pub mod manager;
pub mod oauth1;
pub mod oauth2;
pub mod token_store;

pub use manager::{AuthManager, TokenStatus};
pub use token_store::TokenStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use zeroize::Zeroize;

use crate::error::{AuthError, Result};

/// Tokens expiring within this window are refreshed before use
pub const REFRESH_SKEW: Duration = Duration::from_secs(5 * 60);

/// Credentials obtained from an authorization flow
///
/// `extra` carries network specifics: the X token secret, the Facebook page
/// token, the TikTok open_id. Secrets are wiped from memory on drop.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Unix seconds; `None` for tokens that do not expire
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenSet {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: default_token_type(),
            expires_at: None,
            scope: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Build from a standard OAuth2 token response
    ///
    /// Accepts `expires_in` as a number or numeric string; TikTok's `open_id`
    /// and Meta's `user_id` are kept in `extra`.
    pub fn from_token_response(network: &str, body: &serde_json::Value, now: i64) -> Result<Self> {
        // TikTok nests the payload under "data" in some responses
        let body = body.get("data").filter(|d| d.is_object()).unwrap_or(body);

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                AuthError::ExchangeFailed(
                    network.to_string(),
                    "response did not contain an access_token".to_string(),
                )
            })?;

        let expires_in = body.get("expires_in").and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        });

        let mut token = TokenSet::bearer(access_token);
        token.refresh_token = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if let Some(kind) = body.get("token_type").and_then(|v| v.as_str()) {
            token.token_type = kind.to_string();
        }
        token.expires_at = expires_in.filter(|s| *s > 0).map(|s| now + s);
        token.scope = body
            .get("scope")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        for key in ["open_id", "user_id", "id_token"] {
            if let Some(value) = body.get(key) {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                token.extra.insert(key.to_string(), value);
            }
        }
        Ok(token)
    }

    pub fn expires_in(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|at| at - now)
    }

    /// Expired, or expiring within `skew`
    pub fn is_expired(&self, skew: Duration) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.is_expired_at(now, skew)
    }

    pub fn is_expired_at(&self, now: i64, skew: Duration) -> bool {
        match self.expires_at {
            Some(at) => now + skew.as_secs() as i64 >= at,
            None => false,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        self.is_expired(REFRESH_SKEW)
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("extra", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Drop for TokenSet {
    fn drop(&mut self) {
        self.access_token.zeroize();
        if let Some(refresh) = self.refresh_token.as_mut() {
            refresh.zeroize();
        }
        for value in self.extra.values_mut() {
            value.zeroize();
        }
    }
}
