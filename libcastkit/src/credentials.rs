//! Secure credential storage for castkit
//!
//! Tokens never live in the config file. They go through a [`CredentialManager`]
//! which fronts one or more [`CredentialStore`] backends:
//! - `KeyringStore`: OS-native secure storage (primary)
//! - `EncryptedFileStore`: age-encrypted files protected by a master password
//! - `MemoryStore`: process-local map, used by tests and dry runs
//!
//! Credentials are addressed by `(service, key, account)`. The service is
//! `castkit.{network}`, the key names the secret (`oauth_token`, `token`) and
//! the account selects one of several identities on the same network.
//!
//! ```no_run
//! use libcastkit::credentials::{CredentialConfig, CredentialManager};
//!
//! # fn example() -> libcastkit::Result<()> {
//! let manager = CredentialManager::new(CredentialConfig::default())?;
//! manager.store("castkit.telegram", "token", "123:abc")?;
//! let token = manager.retrieve("castkit.telegram", "token")?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CastError, CredentialError, Result};

pub const DEFAULT_ACCOUNT: &str = "default";
pub const ENV_MASTER_PASSWORD: &str = "CASTKIT_MASTER_PASSWORD";

/// A credential storage backend
///
/// Implementations only need the account-aware methods; the plain variants
/// address the `default` account.
pub trait CredentialStore: Send + Sync {
    fn store_account(&self, service: &str, key: &str, account: &str, value: &str) -> Result<()>;

    /// Returns `CredentialError::NotFound` when nothing is stored
    fn retrieve_account(&self, service: &str, key: &str, account: &str) -> Result<String>;

    /// Deleting a missing credential is not an error
    fn delete_account(&self, service: &str, key: &str, account: &str) -> Result<()>;

    fn exists_account(&self, service: &str, key: &str, account: &str) -> Result<bool>;

    /// Accounts holding a credential for `service`/`key`. Backends that
    /// cannot enumerate return an empty list.
    fn list_accounts(&self, service: &str, key: &str) -> Result<Vec<String>>;

    fn backend_name(&self) -> &str;

    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.store_account(service, key, DEFAULT_ACCOUNT, value)
    }

    fn retrieve(&self, service: &str, key: &str) -> Result<String> {
        self.retrieve_account(service, key, DEFAULT_ACCOUNT)
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        self.delete_account(service, key, DEFAULT_ACCOUNT)
    }

    fn exists(&self, service: &str, key: &str) -> Result<bool> {
        self.exists_account(service, key, DEFAULT_ACCOUNT)
    }
}

fn is_not_found(err: &CastError) -> bool {
    matches!(err, CastError::Credential(CredentialError::NotFound(_)))
}

/// OS keyring backend (macOS Keychain, Windows Credential Manager, Secret Service)
pub struct KeyringStore;

impl KeyringStore {
    pub fn new() -> Result<Self> {
        keyring::Entry::new("castkit.check", "availability_check").map_err(|e| {
            CredentialError::KeyringUnavailable(format!("OS keyring not accessible: {}", e))
        })?;
        Ok(Self)
    }

    /// `castkit.x` + `work` → keyring service `castkit.x.work`
    fn keyring_service(service: &str, account: &str) -> String {
        format!("{}.{}", service, account)
    }

    fn entry(service: &str, key: &str, account: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&Self::keyring_service(service, account), key)
            .map_err(|e| CredentialError::KeyringUnavailable(e.to_string()).into())
    }
}

impl CredentialStore for KeyringStore {
    fn store_account(&self, service: &str, key: &str, account: &str, value: &str) -> Result<()> {
        Self::entry(service, key, account)?
            .set_password(value)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;
        tracing::debug!("Stored {}.{}.{} in OS keyring", service, account, key);
        Ok(())
    }

    fn retrieve_account(&self, service: &str, key: &str, account: &str) -> Result<String> {
        match Self::entry(service, key, account)?.get_password() {
            Ok(value) => Ok(value),
            Err(keyring::Error::NoEntry) => Err(CredentialError::NotFound(format!(
                "{}.{}.{}",
                service, account, key
            ))
            .into()),
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn delete_account(&self, service: &str, key: &str, account: &str) -> Result<()> {
        match Self::entry(service, key, account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn exists_account(&self, service: &str, key: &str, account: &str) -> Result<bool> {
        match Self::entry(service, key, account)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(CredentialError::Keyring(e.to_string()).into()),
        }
    }

    fn list_accounts(&self, _service: &str, _key: &str) -> Result<Vec<String>> {
        // The keyring API cannot enumerate; AccountManager keeps the registry
        Ok(Vec::new())
    }

    fn backend_name(&self) -> &str {
        "keyring"
    }
}

/// Refuse to follow symlinks when reading credential files
pub fn validate_not_symlink(path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path).map_err(CredentialError::Io)?;
    if metadata.file_type().is_symlink() {
        return Err(CredentialError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "Credential file '{}' is a symbolic link; credential files must be regular files",
                path.display()
            ),
        ))
        .into());
    }
    Ok(())
}

/// age-encrypted files named `{service}.{account}.{key}.age`, mode 0600
pub struct EncryptedFileStore {
    base_path: PathBuf,
    master_password: RwLock<Option<SecretString>>,
}

impl EncryptedFileStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            master_password: RwLock::new(None),
        }
    }

    /// At least 8 characters
    pub fn set_master_password(&self, password: String) -> Result<()> {
        if password.chars().count() < 8 {
            return Err(CredentialError::WeakPassword.into());
        }
        let mut guard = self
            .master_password
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(SecretString::from(password));
        Ok(())
    }

    fn passphrase(&self) -> Result<age::secrecy::Secret<String>> {
        let guard = self
            .master_password
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let password = guard.as_ref().ok_or(CredentialError::MasterPasswordNotSet)?;
        Ok(age::secrecy::Secret::new(password.expose_secret().to_string()))
    }

    fn encrypt(&self, data: &str) -> Result<Vec<u8>> {
        let encryptor = age::Encryptor::with_user_passphrase(self.passphrase()?);

        let mut encrypted = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .write_all(data.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        Ok(encrypted)
    }

    fn decrypt(&self, data: &[u8]) -> Result<String> {
        let passphrase = self.passphrase()?;
        let decryptor = match age::Decryptor::new(data) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => {
                return Err(CredentialError::Encryption(
                    "expected a passphrase-encrypted file".to_string(),
                )
                .into())
            }
            Err(e) => return Err(CredentialError::Encryption(e.to_string()).into()),
        };

        let mut reader = decryptor
            .decrypt(&passphrase, None)
            .map_err(|_| CredentialError::DecryptionFailed)?;
        let mut decrypted = Vec::new();
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        String::from_utf8(decrypted)
            .map_err(|e| CredentialError::Encryption(format!("invalid UTF-8: {}", e)).into())
    }

    fn file_path(&self, service: &str, key: &str, account: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}.{}.age", service, account, key))
    }
}

impl CredentialStore for EncryptedFileStore {
    fn store_account(&self, service: &str, key: &str, account: &str, value: &str) -> Result<()> {
        let encrypted = self.encrypt(value)?;
        let path = self.file_path(service, key, account);

        std::fs::create_dir_all(&self.base_path).map_err(CredentialError::Io)?;
        if path.exists() {
            validate_not_symlink(&path)?;
        }
        std::fs::write(&path, encrypted).map_err(CredentialError::Io)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .map_err(CredentialError::Io)?;
        }

        tracing::debug!("Stored encrypted credential at {}", path.display());
        Ok(())
    }

    fn retrieve_account(&self, service: &str, key: &str, account: &str) -> Result<String> {
        let path = self.file_path(service, key, account);
        if !path.exists() {
            return Err(CredentialError::NotFound(format!(
                "{}.{}.{}",
                service, account, key
            ))
            .into());
        }
        validate_not_symlink(&path)?;
        let encrypted = std::fs::read(&path).map_err(CredentialError::Io)?;
        self.decrypt(&encrypted)
    }

    fn delete_account(&self, service: &str, key: &str, account: &str) -> Result<()> {
        let path = self.file_path(service, key, account);
        if path.exists() {
            std::fs::remove_file(&path).map_err(CredentialError::Io)?;
        }
        Ok(())
    }

    fn exists_account(&self, service: &str, key: &str, account: &str) -> Result<bool> {
        Ok(self.file_path(service, key, account).exists())
    }

    fn list_accounts(&self, service: &str, key: &str) -> Result<Vec<String>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}.", service);
        let suffix = format!(".{}.age", key);
        let mut accounts = Vec::new();

        for entry in std::fs::read_dir(&self.base_path).map_err(CredentialError::Io)? {
            let entry = entry.map_err(CredentialError::Io)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(account) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                // Guard against `castkit.x` matching `castkit.xyz.*`
                if !account.contains('.') {
                    accounts.push(account.to_string());
                }
            }
        }

        accounts.sort();
        Ok(accounts)
    }

    fn backend_name(&self) -> &str {
        "encrypted_file"
    }
}

/// In-process store; nothing survives the process
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<(String, String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(service: &str, key: &str, account: &str) -> (String, String, String) {
        (service.to_string(), key.to_string(), account.to_string())
    }
}

impl CredentialStore for MemoryStore {
    fn store_account(&self, service: &str, key: &str, account: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(Self::id(service, key, account), value.to_string());
        Ok(())
    }

    fn retrieve_account(&self, service: &str, key: &str, account: &str) -> Result<String> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&Self::id(service, key, account))
            .cloned()
            .ok_or_else(|| {
                CredentialError::NotFound(format!("{}.{}.{}", service, account, key)).into()
            })
    }

    fn delete_account(&self, service: &str, key: &str, account: &str) -> Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&Self::id(service, key, account));
        Ok(())
    }

    fn exists_account(&self, service: &str, key: &str, account: &str) -> Result<bool> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&Self::id(service, key, account)))
    }

    fn list_accounts(&self, service: &str, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut accounts: Vec<String> = entries
            .keys()
            .filter(|(s, k, _)| s == service && k == key)
            .map(|(_, _, a)| a.clone())
            .collect();
        accounts.sort();
        Ok(accounts)
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Keyring,
    Encrypted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub storage: StorageBackend,

    /// Directory for encrypted files
    #[serde(default = "default_credential_path")]
    pub path: String,

    /// Never serialized; comes from the environment or a prompt
    #[serde(skip)]
    pub master_password: Option<String>,
}

fn default_credential_path() -> String {
    "~/.config/castkit/credentials".to_string()
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Keyring,
            path: default_credential_path(),
            master_password: None,
        }
    }
}

impl CredentialConfig {
    pub fn load_master_password_from_env(&mut self) {
        if let Ok(password) = std::env::var(ENV_MASTER_PASSWORD) {
            if !password.is_empty() {
                self.master_password = Some(password);
                tracing::debug!("Master password taken from {}", ENV_MASTER_PASSWORD);
            }
        }
    }

    pub fn expand_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Facade over the configured backends, tried in priority order
pub struct CredentialManager {
    stores: Vec<Box<dyn CredentialStore>>,
}

impl CredentialManager {
    /// Build the backend list from config
    ///
    /// Keyring is tried first when configured. The encrypted store is used when
    /// configured or as a fallback for an unavailable keyring; its master
    /// password comes from config/env or, on a TTY, an interactive prompt.
    pub fn new(config: CredentialConfig) -> Result<Self> {
        let mut stores: Vec<Box<dyn CredentialStore>> = Vec::new();

        if config.storage == StorageBackend::Keyring {
            match KeyringStore::new() {
                Ok(store) => stores.push(Box::new(store)),
                Err(e) => tracing::warn!("{}. Falling back to encrypted files.", e),
            }
        }

        if stores.is_empty() {
            let encrypted = EncryptedFileStore::new(config.expand_path());
            match config.master_password.clone().or_else(prompt_master_password) {
                Some(password) => {
                    encrypted.set_master_password(password)?;
                    stores.push(Box::new(encrypted));
                }
                None => {
                    tracing::error!(
                        "Master password not set ({} is empty and no TTY is available)",
                        ENV_MASTER_PASSWORD
                    );
                }
            }
        }

        if stores.is_empty() {
            return Err(CredentialError::NoStoreAvailable.into());
        }
        Ok(Self { stores })
    }

    /// Use an explicit backend list (first entry receives writes)
    pub fn with_stores(stores: Vec<Box<dyn CredentialStore>>) -> Self {
        Self { stores }
    }

    /// Manager over a single in-memory store
    pub fn in_memory() -> Self {
        Self::with_stores(vec![Box::new(MemoryStore::new())])
    }

    pub fn backends(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.backend_name()).collect()
    }

    pub fn primary_backend(&self) -> Option<&str> {
        self.stores.first().map(|s| s.backend_name())
    }

    pub fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.store_account(service, key, DEFAULT_ACCOUNT, value)
    }

    pub fn retrieve(&self, service: &str, key: &str) -> Result<String> {
        self.retrieve_account(service, key, DEFAULT_ACCOUNT)
    }

    pub fn delete(&self, service: &str, key: &str) -> Result<()> {
        self.delete_account(service, key, DEFAULT_ACCOUNT)
    }

    pub fn exists(&self, service: &str, key: &str) -> Result<bool> {
        self.exists_account(service, key, DEFAULT_ACCOUNT)
    }

    pub fn store_account(&self, service: &str, key: &str, account: &str, value: &str) -> Result<()> {
        let store = self.stores.first().ok_or(CredentialError::NoStoreAvailable)?;
        store.store_account(service, key, account, value)?;
        tracing::debug!(
            "Stored {}.{}.{} using {} backend",
            service,
            account,
            key,
            store.backend_name()
        );
        Ok(())
    }

    /// NotFound falls through to the next backend; other errors stop the search
    pub fn retrieve_account(&self, service: &str, key: &str, account: &str) -> Result<String> {
        for store in &self.stores {
            match store.retrieve_account(service, key, account) {
                Ok(value) => return Ok(value),
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CredentialError::NotFound(format!("{}.{}.{}", service, account, key)).into())
    }

    pub fn delete_account(&self, service: &str, key: &str, account: &str) -> Result<()> {
        for store in &self.stores {
            store.delete_account(service, key, account)?;
        }
        Ok(())
    }

    pub fn exists_account(&self, service: &str, key: &str, account: &str) -> Result<bool> {
        for store in &self.stores {
            if store.exists_account(service, key, account)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn list_accounts(&self, service: &str, key: &str) -> Result<Vec<String>> {
        let mut accounts = BTreeSet::new();
        for store in &self.stores {
            accounts.extend(store.list_accounts(service, key)?);
        }
        Ok(accounts.into_iter().collect())
    }
}

fn prompt_master_password() -> Option<String> {
    if !atty::is(atty::Stream::Stdin) {
        return None;
    }
    match rpassword::prompt_password("castkit master password: ") {
        Ok(password) if !password.is_empty() => Some(password),
        Ok(_) => None,
        Err(e) => {
            tracing::error!("Failed to read master password: {}", e);
            None
        }
    }
}
