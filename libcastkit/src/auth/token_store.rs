//! Tokens persisted through the credential backends

use std::sync::Arc;

use super::TokenSet;
use crate::credentials::CredentialManager;
use crate::error::{CastError, CredentialError, Result};
use crate::types::Network;

/// Key holding the JSON-encoded [`TokenSet`] of an OAuth network
pub const OAUTH_TOKEN_KEY: &str = "oauth_token";
/// Key holding a bot or system-user token
pub const STATIC_TOKEN_KEY: &str = "token";

#[derive(Clone)]
pub struct TokenStore {
    creds: Arc<CredentialManager>,
}

impl TokenStore {
    pub fn new(creds: Arc<CredentialManager>) -> Self {
        Self { creds }
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.creds
    }

    pub fn load(&self, network: Network, account: &str) -> Result<Option<TokenSet>> {
        let Some(json) = self.get(network, OAUTH_TOKEN_KEY, account)? else {
            return Ok(None);
        };
        let token = serde_json::from_str(&json).map_err(|e| {
            CredentialError::Encryption(format!("stored {} token is unreadable: {}", network, e))
        })?;
        Ok(Some(token))
    }

    pub fn save(&self, network: Network, account: &str, token: &TokenSet) -> Result<()> {
        let json = serde_json::to_string(token)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        self.creds
            .store_account(&network.credential_service(), OAUTH_TOKEN_KEY, account, &json)
    }

    pub fn load_static(&self, network: Network, account: &str) -> Result<Option<String>> {
        self.get(network, STATIC_TOKEN_KEY, account)
    }

    pub fn save_static(&self, network: Network, account: &str, secret: &str) -> Result<()> {
        self.creds
            .store_account(&network.credential_service(), STATIC_TOKEN_KEY, account, secret)
    }

    /// Remove every secret stored for the account
    pub fn clear(&self, network: Network, account: &str) -> Result<()> {
        let service = network.credential_service();
        self.creds.delete_account(&service, OAUTH_TOKEN_KEY, account)?;
        self.creds.delete_account(&service, STATIC_TOKEN_KEY, account)
    }

    pub fn has_any(&self, network: Network, account: &str) -> Result<bool> {
        let service = network.credential_service();
        Ok(self.creds.exists_account(&service, OAUTH_TOKEN_KEY, account)?
            || self.creds.exists_account(&service, STATIC_TOKEN_KEY, account)?)
    }

    /// Accounts holding any secret for the network
    pub fn accounts(&self, network: Network) -> Result<Vec<String>> {
        let service = network.credential_service();
        let mut accounts = self.creds.list_accounts(&service, OAUTH_TOKEN_KEY)?;
        accounts.extend(self.creds.list_accounts(&service, STATIC_TOKEN_KEY)?);
        accounts.sort();
        accounts.dedup();
        Ok(accounts)
    }

    fn get(&self, network: Network, key: &str, account: &str) -> Result<Option<String>> {
        match self
            .creds
            .retrieve_account(&network.credential_service(), key, account)
        {
            Ok(value) => Ok(Some(value)),
            Err(CastError::Credential(CredentialError::NotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
