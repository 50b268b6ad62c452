//! castkit - Unix tools for posting to social networks
//!
//! This library holds everything the `cast-*` binaries share: one adapter per
//! network behind the [`platforms::Platform`] trait, OAuth and bot-token
//! handling, media and feed loading, and the dispatcher that fans an action
//! out to several networks and records the outcome.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod http;
pub mod logging;
pub mod media;
pub mod platforms;
pub mod rate_limiter;
pub mod scheduling;
pub mod types;

// Re-export commonly used types
pub use accounts::AccountManager;
pub use auth::{AuthManager, TokenSet};
pub use config::Config;
pub use credentials::{CredentialConfig, CredentialManager, StorageBackend};
pub use db::{ActionWithRecords, Database};
pub use dispatch::{ActionResult, Dispatcher};
pub use error::{CastError, Result};
pub use types::{Action, MediaSource, Network, Placement, PostOutcome, PostRequest};
