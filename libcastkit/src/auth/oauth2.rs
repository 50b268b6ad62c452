//! OAuth 2.0 authorization code flow
//!
//! One client covers every OAuth2 network; the differences are captured in
//! [`OAuth2Endpoints`]. Meta networks trade the short-lived user token for a
//! long-lived one right after the code exchange and have no refresh token.
//! Facebook "refreshes" by exchanging the current long-lived token again.
//! Threads has a dedicated `th_refresh_token` grant.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

use super::TokenSet;
use crate::error::{AuthError, Result};
use crate::http::HttpClient;
use crate::types::Network;

const GRAPH_VERSION: &str = "v19.0";

/// How an expiring token gets renewed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStyle {
    /// `grant_type=refresh_token`
    Standard,
    /// Re-exchange the current token with `grant_type=fb_exchange_token`
    MetaExchange,
    /// `grant_type=th_refresh_token` on the access token itself
    ThreadsRefresh,
}

/// Per-network OAuth2 endpoints and quirks
#[derive(Debug, Clone)]
pub struct OAuth2Endpoints {
    pub authorize_url: String,
    pub token_url: String,
    /// Long-lived exchange endpoint (Meta, Threads)
    pub exchange_url: Option<String>,
    /// Threads refresh endpoint; other networks refresh at `token_url`
    pub refresh_url: Option<String>,
    pub scopes: Vec<String>,
    pub scope_separator: &'static str,
    /// TikTok calls the client id `client_key`
    pub client_id_param: &'static str,
    pub pkce: bool,
    pub refresh: RefreshStyle,
    /// Graph API token endpoints are called with GET
    pub token_via_get: bool,
    pub extra_authorize_params: Vec<(String, String)>,
}

impl OAuth2Endpoints {
    /// Production endpoints; `None` for networks without an OAuth2 flow
    pub fn for_network(network: Network) -> Option<Self> {
        let graph = format!("https://graph.facebook.com/{}", GRAPH_VERSION);
        let meta = |scopes: &[&str]| Self {
            authorize_url: format!("https://www.facebook.com/{}/dialog/oauth", GRAPH_VERSION),
            token_url: format!("{}/oauth/access_token", graph),
            exchange_url: Some(format!("{}/oauth/access_token", graph)),
            refresh_url: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            scope_separator: ",",
            client_id_param: "client_id",
            pkce: false,
            refresh: RefreshStyle::MetaExchange,
            token_via_get: true,
            extra_authorize_params: Vec::new(),
        };

        let endpoints = match network {
            Network::Facebook => meta(&[
                "pages_show_list",
                "pages_read_engagement",
                "pages_manage_posts",
                "pages_manage_engagement",
                "publish_video",
            ]),
            Network::Instagram => meta(&[
                "instagram_basic",
                "instagram_content_publish",
                "pages_show_list",
                "business_management",
            ]),
            Network::Threads => Self {
                authorize_url: "https://threads.net/oauth/authorize".to_string(),
                token_url: "https://graph.threads.net/oauth/access_token".to_string(),
                exchange_url: Some("https://graph.threads.net/access_token".to_string()),
                refresh_url: Some("https://graph.threads.net/refresh_access_token".to_string()),
                scopes: vec![
                    "threads_basic".to_string(),
                    "threads_content_publish".to_string(),
                    "threads_delete".to_string(),
                ],
                scope_separator: ",",
                client_id_param: "client_id",
                pkce: false,
                refresh: RefreshStyle::ThreadsRefresh,
                token_via_get: false,
                extra_authorize_params: Vec::new(),
            },
            Network::LinkedIn => Self {
                authorize_url: "https://www.linkedin.com/oauth/v2/authorization".to_string(),
                token_url: "https://www.linkedin.com/oauth/v2/accessToken".to_string(),
                exchange_url: None,
                refresh_url: None,
                scopes: vec![
                    "openid".to_string(),
                    "profile".to_string(),
                    "w_member_social".to_string(),
                ],
                scope_separator: " ",
                client_id_param: "client_id",
                pkce: false,
                refresh: RefreshStyle::Standard,
                token_via_get: false,
                extra_authorize_params: Vec::new(),
            },
            Network::YouTube => Self {
                authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                exchange_url: None,
                refresh_url: None,
                scopes: vec![
                    "https://www.googleapis.com/auth/youtube.upload".to_string(),
                    "https://www.googleapis.com/auth/youtube.force-ssl".to_string(),
                ],
                scope_separator: " ",
                client_id_param: "client_id",
                pkce: true,
                refresh: RefreshStyle::Standard,
                token_via_get: false,
                // offline access plus forced consent so Google always returns a refresh token
                extra_authorize_params: vec![
                    ("access_type".to_string(), "offline".to_string()),
                    ("prompt".to_string(), "consent".to_string()),
                ],
            },
            Network::TikTok => Self {
                authorize_url: "https://www.tiktok.com/v2/auth/authorize/".to_string(),
                token_url: "https://open.tiktokapis.com/v2/oauth/token/".to_string(),
                exchange_url: None,
                refresh_url: None,
                scopes: vec![
                    "user.info.basic".to_string(),
                    "video.publish".to_string(),
                    "video.upload".to_string(),
                ],
                scope_separator: ",",
                client_id_param: "client_key",
                pkce: true,
                refresh: RefreshStyle::Standard,
                token_via_get: false,
                extra_authorize_params: Vec::new(),
            },
            Network::X | Network::Discord | Network::Telegram | Network::WhatsApp => return None,
        };
        Some(endpoints)
    }

    /// Point every endpoint at `base`, keeping the paths (used by tests)
    pub fn rebased(mut self, base: &str) -> Self {
        let rebase = |url: &str| -> String {
            match Url::parse(url) {
                Ok(parsed) => format!("{}{}", base.trim_end_matches('/'), parsed.path()),
                Err(_) => url.to_string(),
            }
        };
        self.authorize_url = rebase(&self.authorize_url);
        self.token_url = rebase(&self.token_url);
        self.exchange_url = self.exchange_url.as_deref().map(rebase);
        self.refresh_url = self.refresh_url.as_deref().map(rebase);
        self
    }
}

/// PKCE verifier and its S256 challenge
#[derive(Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = random_string(64);
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    pub fn challenge_for(verifier: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
    }
}

/// Everything needed to finish a flow once the browser comes back
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub pkce: Option<Pkce>,
}

impl AuthorizationRequest {
    /// Check the callback's `state` and extract the code
    pub fn code_from_callback(
        &self,
        network: Network,
        params: &std::collections::HashMap<String, String>,
    ) -> Result<String> {
        if let Some(error) = params.get("error") {
            let description = params
                .get("error_description")
                .or_else(|| params.get("error_reason"))
                .map(|d| format!(": {}", d))
                .unwrap_or_default();
            return Err(AuthError::Denied(format!("{} returned {}{}", network, error, description)).into());
        }
        if params.get("state").map(String::as_str) != Some(self.state.as_str()) {
            return Err(AuthError::StateMismatch.into());
        }
        params
            .get("code")
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| AuthError::Callback("callback did not include a code".to_string()).into())
    }
}

pub struct OAuth2Client {
    network: Network,
    endpoints: OAuth2Endpoints,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    http: HttpClient,
}

impl OAuth2Client {
    pub fn new(
        network: Network,
        endpoints: OAuth2Endpoints,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        http: HttpClient,
    ) -> Self {
        Self {
            network,
            endpoints,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            http,
        }
    }

    pub fn endpoints(&self) -> &OAuth2Endpoints {
        &self.endpoints
    }

    pub fn authorization_request(&self) -> Result<AuthorizationRequest> {
        let state = random_string(32);
        let pkce = self.endpoints.pkce.then(Pkce::generate);

        let mut url = Url::parse(&self.endpoints.authorize_url).map_err(|e| {
            AuthError::Callback(format!("invalid authorize URL for {}: {}", self.network, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(self.endpoints.client_id_param, &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.endpoints.scopes.join(self.endpoints.scope_separator))
                .append_pair("state", &state);
            if let Some(pkce) = &pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", "S256");
            }
            for (k, v) in &self.endpoints.extra_authorize_params {
                query.append_pair(k, v);
            }
        }

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            pkce,
        })
    }

    /// Trade the authorization code for tokens
    pub async fn exchange_code(&self, code: &str, verifier: Option<&str>) -> Result<TokenSet> {
        let mut params = vec![
            (self.endpoints.client_id_param, self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code", code),
        ];
        if let Some(verifier) = verifier {
            params.push(("code_verifier", verifier));
        }

        let body = self
            .token_request(&self.endpoints.token_url, &params, self.endpoints.token_via_get)
            .await
            .map_err(|msg| AuthError::ExchangeFailed(self.network.to_string(), msg))?;
        TokenSet::from_token_response(self.network.as_str(), &body, now())
    }

    /// Swap a short-lived token for a long-lived one where the network offers it
    pub async fn upgrade(&self, token: TokenSet) -> Result<TokenSet> {
        let Some(exchange_url) = self.endpoints.exchange_url.as_deref() else {
            return Ok(token);
        };
        let params: Vec<(&str, &str)> = match self.endpoints.refresh {
            RefreshStyle::ThreadsRefresh => vec![
                ("grant_type", "th_exchange_token"),
                ("client_secret", self.client_secret.as_str()),
                ("access_token", token.access_token.as_str()),
            ],
            _ => vec![
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("fb_exchange_token", token.access_token.as_str()),
            ],
        };

        let body = self
            .token_request(exchange_url, &params, true)
            .await
            .map_err(|msg| AuthError::ExchangeFailed(self.network.to_string(), msg))?;
        let mut upgraded = TokenSet::from_token_response(self.network.as_str(), &body, now())?;
        // the exchange response drops ids returned by the code exchange
        for (k, v) in &token.extra {
            upgraded.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
        tracing::debug!(network = %self.network, "exchanged for long-lived token");
        Ok(upgraded)
    }

    pub fn can_refresh(&self, token: &TokenSet) -> bool {
        match self.endpoints.refresh {
            RefreshStyle::Standard => token.refresh_token.is_some(),
            RefreshStyle::MetaExchange | RefreshStyle::ThreadsRefresh => {
                !token.is_expired(std::time::Duration::ZERO)
            }
        }
    }

    pub async fn refresh(&self, token: &TokenSet) -> Result<TokenSet> {
        let network = self.network.to_string();
        let (url, params, via_get): (&str, Vec<(&str, &str)>, bool) = match self.endpoints.refresh {
            RefreshStyle::Standard => {
                let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
                    AuthError::RefreshFailed(network.clone(), "no refresh token stored".to_string())
                })?;
                (
                    self.endpoints.token_url.as_str(),
                    vec![
                        (self.endpoints.client_id_param, self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                    ],
                    false,
                )
            }
            RefreshStyle::MetaExchange => {
                let url = self.endpoints.exchange_url.as_deref().unwrap_or(&self.endpoints.token_url);
                (
                    url,
                    vec![
                        ("grant_type", "fb_exchange_token"),
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                        ("fb_exchange_token", token.access_token.as_str()),
                    ],
                    true,
                )
            }
            RefreshStyle::ThreadsRefresh => {
                let url = self.endpoints.refresh_url.as_deref().unwrap_or(&self.endpoints.token_url);
                (
                    url,
                    vec![
                        ("grant_type", "th_refresh_token"),
                        ("access_token", token.access_token.as_str()),
                    ],
                    true,
                )
            }
        };

        let body = self
            .token_request(url, &params, via_get)
            .await
            .map_err(|msg| AuthError::RefreshFailed(network.clone(), msg))?;
        let mut refreshed = TokenSet::from_token_response(&network, &body, now())?;

        // Google and LinkedIn omit the refresh token when it is unchanged
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = token.refresh_token.clone();
        }
        for (k, v) in &token.extra {
            refreshed.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
        tracing::info!(network = %network, "refreshed access token");
        Ok(refreshed)
    }

    async fn token_request(
        &self,
        url: &str,
        params: &[(&str, &str)],
        via_get: bool,
    ) -> std::result::Result<serde_json::Value, String> {
        let request = if via_get {
            self.http.inner().get(url).query(params)
        } else {
            self.http.inner().post(url).form(params)
        };
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("HTTP {}: unreadable response: {}", status, e))?;

        // TikTok answers 200 with an "error" field
        let has_error = match body.get("error") {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(other) => other.pointer("/code").and_then(|c| c.as_str()) != Some("ok"),
        };
        if !status.is_success() || has_error {
            let description = body
                .get("error_description")
                .or_else(|| body.pointer("/error/message"))
                .or_else(|| body.get("error"))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_else(|| body.to_string());
            return Err(format!("HTTP {}: {}", status.as_u16(), description));
        }
        Ok(body)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
