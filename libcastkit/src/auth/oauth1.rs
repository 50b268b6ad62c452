//! OAuth 1.0a HMAC-SHA1 request signing
//!
//! X still requires user-context OAuth1 for media upload and is happy with it
//! for the v2 tweet endpoints, so every X request goes through [`OAuth1Signer`].
//! JSON and multipart bodies are not part of the signature base string; only
//! query parameters and form-encoded bodies are.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::Sha1;
use url::Url;

use crate::error::{AuthError, Result};

/// RFC 3986 unreserved characters pass through, everything else is encoded
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, OAUTH_ENCODE_SET).to_string()
}

/// Consumer and (optional) token credentials
#[derive(Clone)]
pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token: Option<String>,
    pub token_secret: Option<String>,
}

impl OAuth1Credentials {
    pub fn consumer(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            consumer_key: key.into(),
            consumer_secret: secret.into(),
            token: None,
            token_secret: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, secret: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self.token_secret = Some(secret.into());
        self
    }
}

impl std::fmt::Debug for OAuth1Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .finish_non_exhaustive()
    }
}

pub struct OAuth1Signer {
    credentials: OAuth1Credentials,
    nonce: Option<String>,
    timestamp: Option<i64>,
}

impl OAuth1Signer {
    pub fn new(credentials: OAuth1Credentials) -> Self {
        Self {
            credentials,
            nonce: None,
            timestamp: None,
        }
    }

    /// Fix nonce and timestamp, for reproducible signatures in tests
    pub fn with_fixed(mut self, nonce: impl Into<String>, timestamp: i64) -> Self {
        self.nonce = Some(nonce.into());
        self.timestamp = Some(timestamp);
        self
    }

    /// Build the `Authorization` header value for a request
    ///
    /// `params` are form-encoded body parameters and extra protocol
    /// parameters such as `oauth_callback` or `oauth_verifier`; query
    /// parameters are taken from `url`.
    pub fn authorization(&self, method: &str, url: &str, params: &[(&str, &str)]) -> Result<String> {
        let nonce = self.nonce.clone().unwrap_or_else(generate_nonce);
        let timestamp = self
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp())
            .to_string();

        let mut oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), self.credentials.consumer_key.clone()),
            ("oauth_nonce".into(), nonce),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp),
            ("oauth_version".into(), "1.0".into()),
        ];
        if let Some(token) = &self.credentials.token {
            oauth_params.push(("oauth_token".into(), token.clone()));
        }
        // protocol parameters passed by the caller belong in the header too
        let (protocol, body): (Vec<_>, Vec<_>) =
            params.iter().partition(|(k, _)| k.starts_with("oauth_"));
        for (k, v) in &protocol {
            oauth_params.push((k.to_string(), v.to_string()));
        }

        let parsed = Url::parse(url)
            .map_err(|e| AuthError::Signing(format!("invalid URL '{}': {}", url, e)))?;
        let mut all: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        all.extend(body.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        all.extend(oauth_params.iter().cloned());

        let signature = self.sign(method, &parsed, all)?;
        oauth_params.push(("oauth_signature".into(), signature));
        oauth_params.sort();

        let header = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {}", header))
    }

    fn sign(&self, method: &str, url: &Url, params: Vec<(String, String)>) -> Result<String> {
        let mut encoded: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (percent_encode(&k), percent_encode(&v)))
            .collect();
        encoded.sort();
        let param_string = encoded
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let mut base_url = url.clone();
        base_url.set_query(None);
        base_url.set_fragment(None);

        let base_string = format!(
            "{}&{}&{}",
            method.to_ascii_uppercase(),
            percent_encode(base_url.as_str()),
            percent_encode(&param_string)
        );
        let key = format!(
            "{}&{}",
            percent_encode(&self.credentials.consumer_secret),
            percent_encode(self.credentials.token_secret.as_deref().unwrap_or(""))
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(base_string.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

/// Parse a form-encoded token response (`oauth_token=...&oauth_token_secret=...`)
pub fn parse_form(body: &str) -> std::collections::HashMap<String, String> {
    url::form_urlencoded::parse(body.trim().as_bytes())
        .into_owned()
        .collect()
}
