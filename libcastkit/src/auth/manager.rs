//! Token lifecycle: interactive authorization, refresh and status

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::callback::{CallbackServer, CALLBACK_PATH};
use super::oauth1::{parse_form, OAuth1Credentials, OAuth1Signer};
use super::oauth2::{OAuth2Client, OAuth2Endpoints};
use super::token_store::TokenStore;
use super::TokenSet;
use crate::config::Config;
use crate::credentials::CredentialManager;
use crate::error::{AuthError, ConfigError, Result};
use crate::http::HttpClient;
use crate::types::Network;

pub const X_OAUTH_BASE: &str = "https://api.x.com";
pub const FACEBOOK_GRAPH_BASE: &str = "https://graph.facebook.com/v19.0";

/// What `cast-auth status` reports for one account
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TokenStatus {
    pub network: Network,
    pub account: String,
    pub kind: &'static str,
    pub stored: bool,
    pub expires_at: Option<i64>,
    pub expired: bool,
    pub refreshable: bool,
}

pub struct AuthManager {
    config: Config,
    tokens: TokenStore,
    http: HttpClient,
    endpoints: HashMap<Network, OAuth2Endpoints>,
    open_browser: bool,
}

impl AuthManager {
    pub fn new(config: Config, creds: Arc<CredentialManager>) -> Result<Self> {
        let http = HttpClient::with_timeout(config.request_timeout())?;
        Ok(Self {
            config,
            tokens: TokenStore::new(creds),
            http,
            endpoints: HashMap::new(),
            open_browser: true,
        })
    }

    /// Replace a network's OAuth2 endpoints
    pub fn with_endpoints(mut self, network: Network, endpoints: OAuth2Endpoints) -> Self {
        self.endpoints.insert(network, endpoints);
        self
    }

    /// Only print the authorization URL
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Run the interactive browser flow and persist the result
    ///
    /// `show_url` receives the URL the user must visit; it is called even when
    /// a browser is opened, since opening can silently fail.
    pub async fn authorize(
        &self,
        network: Network,
        account: &str,
        show_url: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<TokenSet> {
        if network.uses_static_token() {
            return Err(AuthError::StaticTokenNetwork(network.to_string()).into());
        }

        let server = CallbackServer::bind(self.config.auth.callback_port).await?;
        let redirect_uri = server.redirect_uri()?;
        let timeout = Duration::from_secs(self.config.auth.callback_timeout_secs);

        let token = if network == Network::X {
            self.authorize_x(server, &redirect_uri, timeout, show_url).await?
        } else {
            let client = self.oauth2_client(network, &redirect_uri)?;
            let request = client.authorization_request()?;
            self.present(&request.url, show_url);

            let params = server.wait(CALLBACK_PATH, timeout).await?;
            let code = request.code_from_callback(network, &params)?;
            let verifier = request.pkce.as_ref().map(|p| p.verifier.as_str());
            let token = client.exchange_code(&code, verifier).await?;
            let token = client.upgrade(token).await?;
            self.finish(network, token).await?
        };

        self.tokens.save(network, account, &token)?;
        tracing::info!(%network, account, "authorization stored");
        Ok(token)
    }

    /// Load a usable token, refreshing it when it is about to expire
    pub async fn valid_token(&self, network: Network, account: &str) -> Result<TokenSet> {
        let token = self
            .tokens
            .load(network, account)?
            .ok_or_else(|| AuthError::NotAuthorized(network.to_string()))?;

        if network == Network::X || !token.needs_refresh() {
            return Ok(token);
        }

        let client = match self.oauth2_client(network, &self.config.auth.redirect_uri()) {
            Ok(client) => client,
            // a manually stored token without app credentials cannot be refreshed
            Err(_) if !token.is_expired(Duration::ZERO) => return Ok(token),
            Err(_) => return Err(AuthError::Expired(network.to_string()).into()),
        };

        if !client.can_refresh(&token) {
            if token.is_expired(Duration::ZERO) {
                return Err(AuthError::Expired(network.to_string()).into());
            }
            tracing::warn!(%network, "token expires soon and cannot be refreshed");
            return Ok(token);
        }

        match client.refresh(&token).await {
            Ok(refreshed) => {
                self.tokens.save(network, account, &refreshed)?;
                Ok(refreshed)
            }
            Err(e) if !token.is_expired(Duration::ZERO) => {
                tracing::warn!(%network, "refresh failed, using current token: {}", e);
                Ok(token)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh now, regardless of expiry
    pub async fn refresh(&self, network: Network, account: &str) -> Result<TokenSet> {
        if network.uses_static_token() || network == Network::X {
            return Err(AuthError::RefreshFailed(
                network.to_string(),
                "this network's tokens do not expire".to_string(),
            )
            .into());
        }
        let token = self
            .tokens
            .load(network, account)?
            .ok_or_else(|| AuthError::NotAuthorized(network.to_string()))?;
        let client = self.oauth2_client(network, &self.config.auth.redirect_uri())?;
        let refreshed = client.refresh(&token).await?;
        self.tokens.save(network, account, &refreshed)?;
        Ok(refreshed)
    }

    /// Store a secret obtained outside castkit
    ///
    /// Bot-token networks keep it as a static token; OAuth networks wrap it in
    /// a non-expiring bearer token (e.g. a Facebook page token from the
    /// Graph API explorer).
    pub fn store_static(&self, network: Network, account: &str, secret: &str) -> Result<()> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(crate::error::CastError::InvalidInput(
                "Token cannot be empty".to_string(),
            ));
        }
        if network.uses_static_token() {
            self.tokens.save_static(network, account, secret)
        } else {
            self.tokens.save(network, account, &TokenSet::bearer(secret))
        }
    }

    pub fn static_token(&self, network: Network, account: &str) -> Result<String> {
        self.tokens
            .load_static(network, account)?
            .ok_or_else(|| AuthError::NotAuthorized(network.to_string()).into())
    }

    pub fn revoke(&self, network: Network, account: &str) -> Result<()> {
        self.tokens.clear(network, account)
    }

    pub fn status(&self, network: Network, account: &str) -> Result<TokenStatus> {
        let mut status = TokenStatus {
            network,
            account: account.to_string(),
            kind: match network {
                Network::X => "oauth1",
                n if n.uses_static_token() => "static",
                _ => "oauth2",
            },
            stored: false,
            expires_at: None,
            expired: false,
            refreshable: false,
        };

        if network.uses_static_token() {
            status.stored = self.tokens.load_static(network, account)?.is_some();
            return Ok(status);
        }

        if let Some(token) = self.tokens.load(network, account)? {
            status.stored = true;
            status.expires_at = token.expires_at;
            status.expired = token.is_expired(Duration::ZERO);
            status.refreshable = network != Network::X
                && self
                    .oauth2_client(network, &self.config.auth.redirect_uri())
                    .map(|c| c.can_refresh(&token))
                    .unwrap_or(false);
        }
        Ok(status)
    }

    fn present(&self, url: &str, show_url: &(dyn Fn(&str) + Send + Sync)) {
        show_url(url);
        if self.open_browser {
            if let Err(e) = opener::open(url) {
                tracing::warn!("could not open a browser: {}", e);
            }
        }
    }

    /// Build the OAuth2 client from the network's config section
    pub fn oauth2_client(&self, network: Network, redirect_uri: &str) -> Result<OAuth2Client> {
        let missing = |field: &str| -> crate::error::CastError {
            ConfigError::MissingField(format!("{}.{}", network, field)).into()
        };
        let not_configured = || -> crate::error::CastError {
            ConfigError::NetworkNotConfigured(network.to_string()).into()
        };

        let (client_id, client_secret) = match network {
            Network::Facebook => {
                let c = self.config.facebook.as_ref().ok_or_else(not_configured)?;
                (
                    c.app_id.clone().ok_or_else(|| missing("app_id"))?,
                    c.app_secret.clone().ok_or_else(|| missing("app_secret"))?,
                )
            }
            Network::Instagram => {
                let c = self.config.instagram.as_ref().ok_or_else(not_configured)?;
                (
                    c.app_id.clone().ok_or_else(|| missing("app_id"))?,
                    c.app_secret.clone().ok_or_else(|| missing("app_secret"))?,
                )
            }
            Network::Threads => {
                let c = self.config.threads.as_ref().ok_or_else(not_configured)?;
                (
                    c.app_id.clone().ok_or_else(|| missing("app_id"))?,
                    c.app_secret.clone().ok_or_else(|| missing("app_secret"))?,
                )
            }
            Network::LinkedIn => {
                let c = self.config.linkedin.as_ref().ok_or_else(not_configured)?;
                (c.client_id.clone(), c.client_secret.clone())
            }
            Network::YouTube => {
                let c = self.config.youtube.as_ref().ok_or_else(not_configured)?;
                (c.client_id.clone(), c.client_secret.clone())
            }
            Network::TikTok => {
                let c = self.config.tiktok.as_ref().ok_or_else(not_configured)?;
                (c.client_key.clone(), c.client_secret.clone())
            }
            Network::X => {
                return Err(AuthError::Signing("X uses OAuth 1.0a, not OAuth 2".to_string()).into())
            }
            Network::Discord | Network::Telegram | Network::WhatsApp => {
                return Err(AuthError::StaticTokenNetwork(network.to_string()).into())
            }
        };
        if client_id.is_empty() {
            return Err(missing("client_id"));
        }

        let endpoints = match self.endpoints.get(&network) {
            Some(endpoints) => endpoints.clone(),
            None => OAuth2Endpoints::for_network(network).ok_or_else(not_configured)?,
        };
        Ok(OAuth2Client::new(
            network,
            endpoints,
            client_id,
            client_secret,
            redirect_uri,
            self.http.clone(),
        ))
    }

    /// Network-specific work after the token exchange
    async fn finish(&self, network: Network, token: TokenSet) -> Result<TokenSet> {
        match network {
            Network::Facebook => self.attach_page_token(token).await,
            _ => Ok(token),
        }
    }

    /// Facebook posts as the page, which needs its own token
    ///
    /// Page tokens derived from a long-lived user token do not expire.
    async fn attach_page_token(&self, token: TokenSet) -> Result<TokenSet> {
        let Some(facebook) = self.config.facebook.as_ref() else {
            return Ok(token);
        };
        let base = facebook.api_base.as_deref().unwrap_or(FACEBOOK_GRAPH_BASE);
        let url = format!("{}/{}", base.trim_end_matches('/'), facebook.page_id);
        let request = self
            .http
            .inner()
            .get(url)
            .query(&[("fields", "access_token"), ("access_token", token.access_token.as_str())]);
        let body: serde_json::Value = self
            .http
            .send_json("facebook", "fetch page token", request)
            .await?;
        let page_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AuthError::ExchangeFailed(
                    "facebook".to_string(),
                    format!("no page access token for page {}; is the user a page admin?", facebook.page_id),
                )
            })?;
        Ok(token.with_extra("page_token", page_token))
    }

    /// Three-legged OAuth 1.0a
    async fn authorize_x(
        &self,
        server: CallbackServer,
        redirect_uri: &str,
        timeout: Duration,
        show_url: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<TokenSet> {
        let x = self
            .config
            .x
            .as_ref()
            .ok_or_else(|| ConfigError::NetworkNotConfigured("x".to_string()))?;
        let base = x.api_base.as_deref().unwrap_or(X_OAUTH_BASE).trim_end_matches('/');
        let consumer = OAuth1Credentials::consumer(&x.api_key, &x.api_secret);

        let request_token_url = format!("{}/oauth/request_token", base);
        let header = OAuth1Signer::new(consumer.clone()).authorization(
            "POST",
            &request_token_url,
            &[("oauth_callback", redirect_uri)],
        )?;
        let response = self
            .http
            .send(
                "x",
                "request token",
                self.http
                    .inner()
                    .post(&request_token_url)
                    .header("Authorization", header),
            )
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::ExchangeFailed("x".to_string(), e.to_string()))?;
        let request_token = parse_form(&body);
        let (Some(oauth_token), Some(oauth_token_secret)) = (
            request_token.get("oauth_token"),
            request_token.get("oauth_token_secret"),
        ) else {
            return Err(AuthError::ExchangeFailed("x".to_string(), "malformed request token".to_string()).into());
        };

        self.present(
            &format!("{}/oauth/authorize?oauth_token={}", base, oauth_token),
            show_url,
        );
        let params = server.wait(CALLBACK_PATH, timeout).await?;
        if let Some(denied) = params.get("denied") {
            return Err(AuthError::Denied(format!("x denied request token {}", denied)).into());
        }
        if params.get("oauth_token") != Some(oauth_token) {
            return Err(AuthError::StateMismatch.into());
        }
        let verifier = params
            .get("oauth_verifier")
            .ok_or_else(|| AuthError::Callback("callback did not include oauth_verifier".to_string()))?;

        let access_token_url = format!("{}/oauth/access_token", base);
        let header = OAuth1Signer::new(consumer.with_token(oauth_token, oauth_token_secret))
            .authorization("POST", &access_token_url, &[("oauth_verifier", verifier)])?;
        let response = self
            .http
            .send(
                "x",
                "access token",
                self.http
                    .inner()
                    .post(&access_token_url)
                    .header("Authorization", header),
            )
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::ExchangeFailed("x".to_string(), e.to_string()))?;
        let access = parse_form(&body);
        let (Some(token), Some(secret)) = (access.get("oauth_token"), access.get("oauth_token_secret")) else {
            return Err(AuthError::ExchangeFailed("x".to_string(), "malformed access token".to_string()).into());
        };

        let mut token = TokenSet::bearer(token.as_str()).with_extra("token_secret", secret.as_str());
        token.token_type = "OAuth1".to_string();
        for key in ["user_id", "screen_name"] {
            if let Some(value) = access.get(key) {
                token.extra.insert(key.to_string(), value.clone());
            }
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FacebookConfig, LinkedInConfig, TelegramConfig};
    use crate::credentials::DEFAULT_ACCOUNT;
    use crate::error::CastError;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn linkedin_config() -> Config {
        let mut config = Config::default_config();
        config.auth.callback_port = 0;
        config.auth.callback_timeout_secs = 10;
        config.linkedin = Some(LinkedInConfig {
            enabled: true,
            client_id: "li-client".to_string(),
            client_secret: "li-secret".to_string(),
            author_urn: Some("urn:li:person:abc".to_string()),
            api_version: "202405".to_string(),
            api_base: None,
        });
        config
    }

    fn manager(config: Config) -> AuthManager {
        AuthManager::new(config, Arc::new(CredentialManager::in_memory()))
            .unwrap()
            .without_browser()
    }

    #[tokio::test]
    async fn test_static_network_rejects_interactive_flow() {
        let mut config = Config::default_config();
        config.telegram = Some(TelegramConfig {
            enabled: true,
            chat_id: "@chan".to_string(),
            reaction: "👍".to_string(),
            api_base: None,
        });
        let err = manager(config)
            .authorize(Network::Telegram, DEFAULT_ACCOUNT, &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Auth(AuthError::StaticTokenNetwork(_))));
        assert!(err.to_string().contains("cast-auth set telegram"));
    }

    #[tokio::test]
    async fn test_valid_token_without_token_is_not_authorized() {
        let err = manager(linkedin_config())
            .valid_token(Network::LinkedIn, DEFAULT_ACCOUNT)
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Auth(AuthError::NotAuthorized(_))));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_valid_token_refreshes_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/accessToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let endpoints = OAuth2Endpoints::for_network(Network::LinkedIn)
            .unwrap()
            .rebased(&server.uri());
        let manager = manager(linkedin_config()).with_endpoints(Network::LinkedIn, endpoints);
        let stale = TokenSet::bearer("stale")
            .with_refresh_token("rt")
            .with_expiry(chrono::Utc::now().timestamp() + 60);
        manager.tokens().save(Network::LinkedIn, DEFAULT_ACCOUNT, &stale).unwrap();

        let token = manager.valid_token(Network::LinkedIn, DEFAULT_ACCOUNT).await.unwrap();
        assert_eq!(token.access_token, "fresh");
        assert_eq!(token.refresh_token.as_deref(), Some("rt"));

        let stored = manager.tokens().load(Network::LinkedIn, DEFAULT_ACCOUNT).unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh");
    }

    #[tokio::test]
    async fn test_expired_without_refresh_token_fails() {
        let manager = manager(linkedin_config());
        let dead = TokenSet::bearer("dead").with_expiry(1);
        manager.tokens().save(Network::LinkedIn, DEFAULT_ACCOUNT, &dead).unwrap();

        let err = manager
            .valid_token(Network::LinkedIn, DEFAULT_ACCOUNT)
            .await
            .unwrap_err();
        assert!(matches!(err, CastError::Auth(AuthError::Expired(_))));
        assert!(err.to_string().contains("cast-auth authorize linkedin"));
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_unexpired_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("{}"))
            .mount(&server)
            .await;
        let endpoints = OAuth2Endpoints::for_network(Network::LinkedIn)
            .unwrap()
            .rebased(&server.uri());
        let manager = manager(linkedin_config()).with_endpoints(Network::LinkedIn, endpoints);
        let soon = TokenSet::bearer("soon")
            .with_refresh_token("rt")
            .with_expiry(chrono::Utc::now().timestamp() + 120);
        manager.tokens().save(Network::LinkedIn, DEFAULT_ACCOUNT, &soon).unwrap();

        let token = manager.valid_token(Network::LinkedIn, DEFAULT_ACCOUNT).await.unwrap();
        assert_eq!(token.access_token, "soon");
    }

    #[tokio::test]
    async fn test_authorize_linkedin_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/v2/accessToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "li-at",
                "refresh_token": "li-rt",
                "expires_in": 5184000
            })))
            .mount(&server)
            .await;
        let endpoints = OAuth2Endpoints::for_network(Network::LinkedIn)
            .unwrap()
            .rebased(&server.uri());
        let manager = Arc::new(manager(linkedin_config()).with_endpoints(Network::LinkedIn, endpoints));

        // play the browser: follow the authorize URL's redirect_uri with the right state
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let browser = tokio::spawn(async move {
            let url = rx.recv().await.unwrap();
            let url = url::Url::parse(&url).unwrap();
            let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let callback = format!(
                "{}?code=granted&state={}",
                query["redirect_uri"], query["state"]
            );
            reqwest::get(callback).await.unwrap().status()
        });

        let show = move |url: &str| {
            let _ = tx.send(url.to_string());
        };
        let token = manager
            .authorize(Network::LinkedIn, "work", &show)
            .await
            .unwrap();
        assert_eq!(token.access_token, "li-at");
        assert_eq!(browser.await.unwrap(), 200);

        let status = manager.status(Network::LinkedIn, "work").unwrap();
        assert!(status.stored);
        assert!(status.refreshable);
        assert!(!status.expired);
        assert_eq!(status.kind, "oauth2");
    }

    #[tokio::test]
    async fn test_facebook_page_token_is_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1234"))
            .and(query_param("fields", "access_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "page-tok", "id": "1234"})),
            )
            .mount(&server)
            .await;

        let mut config = Config::default_config();
        config.facebook = Some(FacebookConfig {
            enabled: true,
            page_id: "1234".to_string(),
            app_id: Some("app".to_string()),
            app_secret: Some("secret".to_string()),
            api_base: Some(server.uri()),
            video_base: None,
        });
        let token = manager(config)
            .finish(Network::Facebook, TokenSet::bearer("user-tok"))
            .await
            .unwrap();
        assert_eq!(token.extra("page_token"), Some("page-tok"));
    }

    #[test]
    fn test_store_static_and_status() {
        let manager = manager(Config::default_config());
        manager
            .store_static(Network::Discord, DEFAULT_ACCOUNT, " bot-token \n")
            .unwrap();
        assert_eq!(
            manager.static_token(Network::Discord, DEFAULT_ACCOUNT).unwrap(),
            "bot-token"
        );
        let status = manager.status(Network::Discord, DEFAULT_ACCOUNT).unwrap();
        assert_eq!(status.kind, "static");
        assert!(status.stored);

        assert!(manager.store_static(Network::Discord, DEFAULT_ACCOUNT, "  ").is_err());

        manager.revoke(Network::Discord, DEFAULT_ACCOUNT).unwrap();
        assert!(manager.static_token(Network::Discord, DEFAULT_ACCOUNT).is_err());
    }

    #[test]
    fn test_oauth2_client_requires_app_credentials() {
        let mut config = Config::default_config();
        config.facebook = Some(FacebookConfig {
            enabled: true,
            page_id: "1".to_string(),
            app_id: None,
            app_secret: None,
            api_base: None,
            video_base: None,
        });
        let manager = manager(config);
        let err = manager
            .oauth2_client(Network::Facebook, "http://127.0.0.1/callback")
            .err()
            .unwrap();
        assert!(err.to_string().contains("facebook.app_id"));

        let err = manager
            .oauth2_client(Network::YouTube, "http://127.0.0.1/callback")
            .err()
            .unwrap();
        assert!(err.to_string().contains("youtube"));
    }
}
