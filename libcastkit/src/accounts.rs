//! Named accounts per network
//!
//! A user may hold several identities on one network (a personal X handle and
//! a company one). Credentials are stored per account; this module tracks which
//! accounts exist and which one is active, in `accounts.toml` next to the config.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::credentials::DEFAULT_ACCOUNT;
use crate::error::{AccountError, Result};
use crate::types::Network;

const RESERVED_NAMES: [&str; 3] = ["all", "none", "list"];

#[derive(Clone)]
pub struct AccountManager {
    state_file: PathBuf,
    state: Arc<RwLock<AccountState>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountState {
    /// network → active account
    #[serde(default)]
    pub active: BTreeMap<String, String>,
    /// network → registered account names
    #[serde(default)]
    pub accounts: BTreeMap<String, Vec<String>>,
}

impl AccountManager {
    /// Manager backed by `accounts.toml` in the castkit config directory
    pub fn new() -> Result<Self> {
        let dir = crate::config::resolve_state_dir()?;
        Self::with_path(dir.join("accounts.toml"))
    }

    pub fn with_path(state_file: PathBuf) -> Result<Self> {
        let state = Self::load(&state_file)?;
        Ok(Self {
            state_file,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Alphanumeric plus `-`/`_`, 1 to 64 chars, not `all`/`none`/`list`
    pub fn validate_account_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(AccountError::InvalidName("account name cannot be empty".to_string()).into());
        }
        if name.chars().count() > 64 {
            return Err(AccountError::InvalidName(format!(
                "'{}' is longer than 64 characters",
                name
            ))
            .into());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AccountError::InvalidName(format!(
                "'{}' may only contain letters, digits, '-' and '_'",
                name
            ))
            .into());
        }
        if RESERVED_NAMES.contains(&name.to_lowercase().as_str()) {
            return Err(AccountError::ReservedName(name.to_string()).into());
        }
        Ok(())
    }

    /// Falls back to `default` when nothing was selected
    pub fn active_account(&self, network: Network) -> String {
        self.read()
            .active
            .get(network.as_str())
            .cloned()
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string())
    }

    /// Explicit account if given (validated), otherwise the active one
    pub fn resolve(&self, network: Network, explicit: Option<&str>) -> Result<String> {
        match explicit {
            Some(name) => {
                Self::validate_account_name(name)?;
                Ok(name.to_string())
            }
            None => Ok(self.active_account(network)),
        }
    }

    pub fn set_active_account(&self, network: Network, account: &str) -> Result<()> {
        Self::validate_account_name(account)?;
        if !self.account_exists(network, account) {
            return Err(
                AccountError::NotFound(account.to_string(), network.to_string()).into(),
            );
        }
        self.write()
            .active
            .insert(network.to_string(), account.to_string());
        self.save()
    }

    pub fn list_accounts(&self, network: Network) -> Vec<String> {
        self.read()
            .accounts
            .get(network.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn register_account(&self, network: Network, account: &str) -> Result<()> {
        Self::validate_account_name(account)?;
        {
            let mut state = self.write();
            let names = state.accounts.entry(network.to_string()).or_default();
            if !names.iter().any(|n| n == account) {
                names.push(account.to_string());
                names.sort();
            }
        }
        self.save()
    }

    /// Removing the active account resets the network to `default`
    pub fn unregister_account(&self, network: Network, account: &str) -> Result<()> {
        {
            let mut state = self.write();
            if let Some(names) = state.accounts.get_mut(network.as_str()) {
                names.retain(|n| n != account);
            }
            if state.active.get(network.as_str()).map(String::as_str) == Some(account) {
                state.active.remove(network.as_str());
            }
        }
        self.save()
    }

    pub fn account_exists(&self, network: Network, account: &str) -> bool {
        self.read()
            .accounts
            .get(network.as_str())
            .map(|names| names.iter().any(|n| n == account))
            .unwrap_or(false)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AccountState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AccountState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AccountError::StateFile(format!("create directory: {}", e)))?;
        }
        let content = toml::to_string_pretty(&*self.read())
            .map_err(|e| AccountError::StateFile(format!("serialize: {}", e)))?;
        std::fs::write(&self.state_file, content)
            .map_err(|e| AccountError::StateFile(format!("write: {}", e)))?;
        Ok(())
    }

    /// A corrupt file is logged and replaced by empty state on the next save
    fn load(path: &PathBuf) -> Result<AccountState> {
        if !path.exists() {
            return Ok(AccountState::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| AccountError::StateFile(format!("read: {}", e)))?;
        match toml::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                tracing::warn!("Ignoring corrupt account state {}: {}", path.display(), e);
                Ok(AccountState::default())
            }
        }
    }
}
