//! Mock platform implementation for testing
//!
//! A configurable stand-in for a network adapter. It can succeed, fail
//! authentication, fail every action, or fail transiently a fixed number of
//! times before succeeding, which is what the dispatcher's retry tests need.
//! Every call is recorded so tests can assert on what reached the "network".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::Platform;
use crate::types::{Action, Network, PostOutcome, PostRequest};

/// One call the mock received
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub action: Action,
    pub target: Option<String>,
    pub content: Option<String>,
}

/// Configuration for mock platform behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub network: Network,

    /// Whether authentication should succeed
    pub auth_succeeds: bool,

    /// Whether actions should succeed
    pub action_succeeds: bool,

    pub auth_error: Option<String>,
    pub action_error: Option<String>,

    /// Number of leading action calls that fail with a network error
    pub transient_failures: usize,

    /// Delay before completing operations (simulates network latency)
    pub delay: Duration,

    pub character_limit: Option<usize>,
    pub native_schedule: bool,

    pub auth_call_count: Arc<Mutex<usize>>,
    pub calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            auth_succeeds: true,
            action_succeeds: true,
            auth_error: None,
            action_error: None,
            transient_failures: 0,
            delay: Duration::from_millis(0),
            character_limit: None,
            native_schedule: false,
            auth_call_count: Arc::new(Mutex::new(0)),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock platform for testing
pub struct MockPlatform {
    config: MockConfig,
    authenticated: bool,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config,
            authenticated: false,
        }
    }

    /// Create a mock platform that always succeeds
    pub fn success(network: Network) -> Self {
        Self::new(MockConfig::new(network))
    }

    /// Already authenticated, for tests that skip the login step
    pub fn ready(network: Network) -> Self {
        let mut platform = Self::success(network);
        platform.authenticated = true;
        platform
    }

    pub fn auth_failure(network: Network, error: &str) -> Self {
        Self::new(MockConfig {
            auth_succeeds: false,
            auth_error: Some(error.to_string()),
            ..MockConfig::new(network)
        })
    }

    /// Authenticated, but every action fails with `error`
    pub fn failure(network: Network, error: &str) -> Self {
        let mut platform = Self::new(MockConfig {
            action_succeeds: false,
            action_error: Some(error.to_string()),
            ..MockConfig::new(network)
        });
        platform.authenticated = true;
        platform
    }

    /// Fails with a network error `failures` times, then succeeds
    pub fn flaky(network: Network, failures: usize) -> Self {
        let mut platform = Self::new(MockConfig {
            transient_failures: failures,
            ..MockConfig::new(network)
        });
        platform.authenticated = true;
        platform
    }

    pub fn with_delay(network: Network, delay: Duration) -> Self {
        Self::new(MockConfig {
            delay,
            ..MockConfig::new(network)
        })
    }

    pub fn with_limit(network: Network, limit: usize) -> Self {
        Self::new(MockConfig {
            character_limit: Some(limit),
            ..MockConfig::new(network)
        })
    }

    pub fn with_native_schedule(mut self) -> Self {
        self.config.native_schedule = true;
        self
    }

    /// Shared handle to the call log, usable after the mock is boxed
    pub fn call_log(&self) -> Arc<Mutex<Vec<MockCall>>> {
        Arc::clone(&self.config.calls)
    }

    pub fn auth_call_count(&self) -> usize {
        *self.config.auth_call_count.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.config.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    async fn act(&self, action: Action, target: Option<&str>, content: Option<&str>) -> Result<PostOutcome> {
        let attempt = {
            let mut calls = self.config.calls.lock().unwrap_or_else(|p| p.into_inner());
            calls.push(MockCall {
                action,
                target: target.map(str::to_string),
                content: content.map(str::to_string),
            });
            calls.len()
        };

        if !self.authenticated {
            return Err(PlatformError::Authentication("Not authenticated".to_string()).into());
        }

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if attempt <= self.config.transient_failures {
            return Err(PlatformError::Network(format!("mock {} connection reset", self.name())).into());
        }

        if !self.config.action_succeeds {
            let error = self
                .config
                .action_error
                .clone()
                .unwrap_or_else(|| "Mock action failed".to_string());
            return Err(PlatformError::Posting(error).into());
        }

        let id = match target {
            Some(target) if action != Action::Share => target.to_string(),
            _ => format!("mock-{}", uuid::Uuid::new_v4()),
        };
        Ok(PostOutcome::new(self.config.network, id.clone())
            .with_url(format!("https://mock.invalid/{}/{}", self.name(), id)))
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn network(&self) -> Network {
        self.config.network
    }

    async fn authenticate(&mut self) -> Result<()> {
        *self.config.auth_call_count.lock().unwrap_or_else(|p| p.into_inner()) += 1;

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        if self.config.auth_succeeds {
            self.authenticated = true;
            Ok(())
        } else {
            let error = self
                .config
                .auth_error
                .clone()
                .unwrap_or_else(|| "Mock authentication failed".to_string());
            Err(PlatformError::Authentication(error).into())
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.authenticated = false;
        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn post(&self, request: &PostRequest) -> Result<PostOutcome> {
        self.validate(request)?;
        self.act(Action::Post, None, Some(&request.text_with_link())).await
    }

    async fn like(&self, id: &str) -> Result<PostOutcome> {
        self.act(Action::Like, Some(id), None).await
    }

    async fn delete(&self, id: &str) -> Result<PostOutcome> {
        self.act(Action::Delete, Some(id), None).await
    }

    async fn share(&self, id: &str, comment: Option<&str>) -> Result<PostOutcome> {
        self.act(Action::Share, Some(id), comment).await
    }

    async fn upload_video(&self, request: &PostRequest) -> Result<PostOutcome> {
        self.validate(request)?;
        self.act(Action::Video, None, Some(&request.text_with_link())).await
    }

    async fn schedule(&self, request: &PostRequest, _at: DateTime<Utc>) -> Result<PostOutcome> {
        if !self.config.native_schedule {
            return Err(PlatformError::unsupported(self.name(), "native scheduling").into());
        }
        self.validate(request)?;
        self.act(Action::Schedule, None, Some(&request.text_with_link())).await
    }

    fn supports_native_schedule(&self) -> bool {
        self.config.native_schedule
    }

    fn character_limit(&self) -> Option<usize> {
        self.config.character_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CastError;

    #[tokio::test]
    async fn test_mock_success() {
        let mut platform = MockPlatform::success(Network::X);
        assert_eq!(platform.name(), "x");
        assert_eq!(platform.character_limit(), None);

        platform.authenticate().await.unwrap();
        assert_eq!(platform.auth_call_count(), 1);

        let outcome = platform.post(&PostRequest::text("Test content")).await.unwrap();
        assert!(outcome.id.starts_with("mock-"));
        assert_eq!(outcome.network, Network::X);

        let calls = platform.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, Action::Post);
        assert_eq!(calls[0].content.as_deref(), Some("Test content"));
    }

    #[tokio::test]
    async fn test_mock_auth_failure() {
        let mut platform = MockPlatform::auth_failure(Network::LinkedIn, "Invalid credentials");

        let err = platform.authenticate().await.unwrap_err();
        assert_eq!(platform.auth_call_count(), 1);
        assert!(err.to_string().contains("Invalid credentials"));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_mock_action_failure() {
        let platform = MockPlatform::failure(Network::Threads, "Server exploded");

        let err = platform.like("42").await.unwrap_err();
        assert!(err.to_string().contains("Server exploded"));
        assert!(!err.is_transient());
        assert_eq!(platform.calls()[0].target.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_mock_flaky_recovers() {
        let platform = MockPlatform::flaky(Network::Discord, 2);

        assert!(platform.delete("1").await.unwrap_err().is_transient());
        assert!(platform.delete("1").await.unwrap_err().is_transient());
        let outcome = platform.delete("1").await.unwrap();
        assert_eq!(outcome.id, "1");
        assert_eq!(platform.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_with_delay() {
        let mut platform = MockPlatform::with_delay(Network::Telegram, Duration::from_millis(50));

        let start = std::time::Instant::now();
        platform.authenticate().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));

        let start = std::time::Instant::now();
        platform.post(&PostRequest::text("Test")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mock_with_character_limit() {
        let platform = MockPlatform::with_limit(Network::X, 10);

        assert!(platform.validate(&PostRequest::text("Short")).is_ok());
        let err = platform.validate(&PostRequest::text("This is way too long")).unwrap_err();
        assert!(matches!(err, CastError::Platform(PlatformError::Validation(_))));
    }

    #[tokio::test]
    async fn test_mock_requires_authentication() {
        let platform = MockPlatform::success(Network::Facebook);

        let err = platform.post(&PostRequest::text("Test")).await.unwrap_err();
        assert!(err.to_string().contains("Not authenticated"));
    }

    #[tokio::test]
    async fn test_mock_schedule_needs_native_support() {
        let at = Utc::now() + chrono::Duration::hours(1);
        let plain = MockPlatform::ready(Network::X);
        assert!(!plain.supports_native_schedule());
        assert!(plain.schedule(&PostRequest::text("later"), at).await.is_err());

        let native = MockPlatform::ready(Network::Facebook).with_native_schedule();
        let outcome = native.schedule(&PostRequest::text("later"), at).await.unwrap();
        assert!(!outcome.id.is_empty());
    }
}
