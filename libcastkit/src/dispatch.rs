//! Action dispatch across networks
//!
//! `create_platforms` turns a `--network` list into authenticated adapters.
//! `Dispatcher::run` fans one action out to all of them concurrently, retries
//! transient failures with exponential backoff and records the action and
//! each network's outcome in the history database.

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::accounts::AccountManager;
use crate::auth::AuthManager;
use crate::config::Config;
use crate::db::Database;
use crate::error::{CastError, ConfigError, PlatformError, Result};
use crate::platforms::{
    discord::DiscordPlatform, facebook::FacebookPlatform, instagram::InstagramPlatform,
    linkedin::LinkedInPlatform, telegram::TelegramPlatform, threads::ThreadsPlatform,
    tiktok::TikTokPlatform, whatsapp::WhatsAppPlatform, x::XPlatform, youtube::YouTubePlatform,
    Platform, PlatformSettings,
};
use crate::types::{
    Action, ActionEntry, ActionRecord, ActionStatus, Network, PostOutcome, PostRequest, QueuedPost,
};

/// Outcome of one action on one network
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionResult {
    pub network: Network,
    pub success: bool,
    /// Accepted into the local schedule queue rather than sent
    pub queued: bool,
    pub outcome: Option<PostOutcome>,
    pub error: Option<String>,
    /// Exit code the error maps to; 0 on success
    #[serde(skip)]
    pub exit_code: i32,
}

impl ActionResult {
    fn ok(network: Network, outcome: PostOutcome) -> Self {
        Self {
            network,
            success: true,
            queued: false,
            outcome: Some(outcome),
            error: None,
            exit_code: 0,
        }
    }

    fn queued(network: Network, queue_id: &str) -> Self {
        Self {
            network,
            success: true,
            queued: true,
            outcome: Some(PostOutcome::new(network, queue_id)),
            error: None,
            exit_code: 0,
        }
    }

    fn failed(network: Network, error: &CastError) -> Self {
        Self {
            network,
            success: false,
            queued: false,
            outcome: None,
            error: Some(error.to_string()),
            exit_code: error.exit_code(),
        }
    }

    /// `network:id` as printed by `cast-post`
    pub fn line(&self) -> String {
        match (&self.outcome, &self.error) {
            (Some(outcome), _) if self.queued => format!("{}:queued:{}", self.network, outcome.id),
            (Some(outcome), _) => format!("{}:{}", self.network, outcome.id),
            (None, Some(error)) => format!("{}:error:{}", self.network, error),
            (None, None) => format!("{}:error", self.network),
        }
    }
}

/// Process exit code for a batch of results
///
/// 0 when everything succeeded. Otherwise 3 if any failure was invalid
/// input, 2 if every failure was an authentication problem, else 1.
pub fn exit_code(results: &[ActionResult]) -> i32 {
    let failures: Vec<&ActionResult> = results.iter().filter(|r| !r.success).collect();
    if results.is_empty() {
        return 1;
    }
    if failures.is_empty() {
        return 0;
    }
    if failures.iter().any(|r| r.exit_code == 3) {
        3
    } else if failures.iter().all(|r| r.exit_code == 2) {
        2
    } else {
        1
    }
}

/// Build and authenticate the adapter for one network
///
/// OAuth networks get their token through `AuthManager::valid_token`, which
/// refreshes it when needed. Bot-token networks read the stored static token.
///
/// # Errors
///
/// Returns a config error when the network has no config section and an auth
/// error when no usable credential is stored.
pub async fn create_platform(
    config: &Config,
    network: Network,
    auth: &AuthManager,
    account: &str,
) -> Result<Box<dyn Platform>> {
    let settings = PlatformSettings::from_config(config)?;
    let not_configured = || -> CastError { ConfigError::NetworkNotConfigured(network.to_string()).into() };
    debug!(%network, account, "creating platform client");

    let mut platform: Box<dyn Platform> = match network {
        Network::X => {
            let section = config.x.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            Box::new(XPlatform::new(section, &token, &settings)?)
        }
        Network::Facebook => {
            let section = config.facebook.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            let page_token = token
                .extra("page_token")
                .map(str::to_string)
                .unwrap_or_else(|| token.access_token.clone());
            Box::new(FacebookPlatform::new(section, page_token, &settings))
        }
        Network::Instagram => {
            let section = config.instagram.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            Box::new(InstagramPlatform::new(section, token.access_token.clone(), &settings))
        }
        Network::LinkedIn => {
            let section = config.linkedin.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            Box::new(LinkedInPlatform::new(section, token.access_token.clone(), &settings))
        }
        Network::YouTube => {
            let section = config.youtube.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            Box::new(YouTubePlatform::new(section, token.access_token.clone(), &settings))
        }
        Network::TikTok => {
            let section = config.tiktok.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            Box::new(TikTokPlatform::new(section, token.access_token.clone(), &settings))
        }
        Network::Threads => {
            let section = config.threads.as_ref().ok_or_else(not_configured)?;
            let token = auth.valid_token(network, account).await?;
            Box::new(ThreadsPlatform::new(section, token.access_token.clone(), &settings))
        }
        Network::Discord => {
            let section = config.discord.as_ref().ok_or_else(not_configured)?;
            let token = auth.static_token(network, account)?;
            Box::new(DiscordPlatform::new(section, token, &settings))
        }
        Network::Telegram => {
            let section = config.telegram.as_ref().ok_or_else(not_configured)?;
            let token = auth.static_token(network, account)?;
            Box::new(TelegramPlatform::new(section, token, &settings))
        }
        Network::WhatsApp => {
            let section = config.whatsapp.as_ref().ok_or_else(not_configured)?;
            let token = auth.static_token(network, account)?;
            Box::new(WhatsAppPlatform::new(section, token, &settings))
        }
    };

    platform.authenticate().await?;
    Ok(platform)
}

/// Build adapters for every requested network
///
/// `account` overrides the active account from `accounts.toml`. Fails on the
/// first network that cannot be built.
pub async fn create_platforms(
    config: &Config,
    networks: &[Network],
    auth: &AuthManager,
    accounts: &AccountManager,
    account: Option<&str>,
) -> Result<Vec<Box<dyn Platform>>> {
    let mut platforms = Vec::with_capacity(networks.len());
    for &network in networks {
        if !config.is_enabled(network) {
            return Err(ConfigError::NetworkNotConfigured(network.to_string()).into());
        }
        let account = accounts.resolve(network, account)?;
        info!(%network, account = %account, "creating platform client");
        platforms.push(create_platform(config, network, auth, &account).await?);
    }
    Ok(platforms)
}

/// Run one action against one platform, retrying transient failures
///
/// Attempts are spaced 1s, 2s, 4s… (times `base_delay`).
async fn with_retry(
    platform: &dyn Platform,
    action: Action,
    request: &PostRequest,
    target: &str,
    at: Option<DateTime<Utc>>,
    attempts: u32,
    base_delay: Duration,
) -> Result<PostOutcome> {
    let attempts = attempts.max(1);
    let name = platform.name().to_string();
    let mut attempt = 1;

    loop {
        let result = match action {
            Action::Post => platform.post(request).await,
            Action::Like => platform.like(target).await,
            Action::Delete => platform.delete(target).await,
            Action::Share => platform.share(target, Some(request.content.as_str()).filter(|c| !c.is_empty())).await,
            Action::Video => platform.upload_video(request).await,
            Action::Schedule => match at {
                Some(at) => platform.schedule(request, at).await,
                None => Err(CastError::InvalidInput("schedule requires a time".to_string())),
            },
            Action::Authorize => Err(CastError::InvalidInput(
                "authorize is handled by cast-auth".to_string(),
            )),
        };

        match result {
            Ok(outcome) => {
                if attempt > 1 {
                    info!("{} succeeded on {} attempt {}", action, name, attempt);
                }
                return Ok(outcome);
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = base_delay * 2_u32.pow(attempt - 1);
                warn!(
                    "Transient error on {} (attempt {}/{}): {}. Retrying in {:?}...",
                    name, attempt, attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!("{} failed on {} after {} attempts: {}", action, name, attempt, e);
                }
                return Err(e);
            }
        }
    }
}

/// Fans actions out to a set of authenticated platforms
pub struct Dispatcher {
    platforms: Vec<Box<dyn Platform>>,
    db: Database,
    retry_attempts: u32,
    retry_delay: Duration,
    account: Option<String>,
}

impl Dispatcher {
    pub fn new(platforms: Vec<Box<dyn Platform>>, db: Database) -> Self {
        Self {
            platforms,
            db,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            account: None,
        }
    }

    /// Attempts per network and the first backoff step
    pub fn with_retry(mut self, attempts: u32, first_delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay = first_delay;
        self
    }

    /// Account name written to history rows
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn networks(&self) -> Vec<Network> {
        self.platforms.iter().map(|p| p.network()).collect()
    }

    /// Perform `action` on every platform and record the results
    ///
    /// For `Action::Schedule`, `request.scheduled_at` must be set. Networks
    /// with native scheduling get the request now; the rest are queued for
    /// `cast-send`.
    ///
    /// # Errors
    ///
    /// Only invalid invocations fail as a whole (missing `--id`, missing
    /// schedule time, `authorize`). Per-network failures are reported in the
    /// returned results.
    pub async fn run(&self, action: Action, request: &PostRequest, target: Option<&str>) -> Result<Vec<ActionResult>> {
        if action == Action::Authorize {
            return Err(CastError::InvalidInput(
                "authorize is handled by cast-auth, not dispatched".to_string(),
            ));
        }
        let target = match (action.needs_target(), target) {
            (true, None) | (true, Some("")) => {
                return Err(CastError::InvalidInput(format!("{} requires --id", action)));
            }
            (_, target) => target.unwrap_or_default(),
        };
        let at = match action {
            Action::Schedule => Some(schedule_time(request)?),
            _ => None,
        };

        let mut entry = ActionEntry::new(
            action,
            request.text_with_link(),
            Some(target.to_string()).filter(|t| !t.is_empty()),
        );
        entry.scheduled_at = at.map(|t| t.timestamp());
        entry.metadata = serde_json::to_string(request).ok();
        if let Err(e) = self.db.create_action(&entry).await {
            warn!("Failed to record action in history: {}", e);
        }

        let (immediate, deferred): (Vec<&dyn Platform>, Vec<&dyn Platform>) = self
            .platforms
            .iter()
            .map(|p| p.as_ref())
            .partition(|p| action != Action::Schedule || p.supports_native_schedule());

        let futures = immediate.into_iter().map(|platform| async move {
            let network = platform.network();
            info!(%network, %action, "dispatching");
            match with_retry(platform, action, request, target, at, self.retry_attempts, self.retry_delay).await {
                Ok(outcome) => ActionResult::ok(network, outcome),
                Err(e) => {
                    warn!("{} on {} failed: {}", action, network, e);
                    ActionResult::failed(network, &e)
                }
            }
        });
        let mut results = join_all(futures).await;

        if let Some(at) = at {
            let networks: Vec<Network> = deferred.iter().map(|p| p.network()).collect();
            if !networks.is_empty() {
                results.extend(self.enqueue(request, networks, at).await);
            }
        }

        self.record(&entry, &results).await;
        Ok(results)
    }

    async fn enqueue(&self, request: &PostRequest, networks: Vec<Network>, at: DateTime<Utc>) -> Vec<ActionResult> {
        let queued = QueuedPost {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.clone(),
            networks: networks.clone(),
            due_at: at.timestamp(),
            attempts: 0,
            account: self.account.clone(),
        };
        match self.db.enqueue(&queued).await {
            Ok(()) => {
                info!(id = %queued.id, due_at = queued.due_at, "queued for cast-send");
                networks.into_iter().map(|n| ActionResult::queued(n, &queued.id)).collect()
            }
            Err(e) => networks.into_iter().map(|n| ActionResult::failed(n, &e)).collect(),
        }
    }

    async fn record(&self, entry: &ActionEntry, results: &[ActionResult]) {
        let now = Utc::now().timestamp();
        let account = self.account.clone().unwrap_or_else(|| "default".to_string());

        for result in results {
            let record = ActionRecord {
                id: None,
                action_id: entry.id.clone(),
                network: result.network.to_string(),
                platform_id: result.outcome.as_ref().map(|o| o.id.clone()),
                url: result.outcome.as_ref().and_then(|o| o.url.clone()),
                completed_at: (result.success && !result.queued).then_some(now),
                success: result.success,
                error_message: result.error.clone(),
                account_name: account.clone(),
            };
            if let Err(e) = self.db.create_action_record(&record).await {
                warn!("Failed to record result for {}: {}", result.network, e);
            }
        }

        let status = if results.iter().any(|r| r.queued) {
            ActionStatus::Scheduled
        } else if results.iter().any(|r| r.success) {
            ActionStatus::Posted
        } else {
            ActionStatus::Failed
        };
        if let Err(e) = self.db.update_action_status(&entry.id, status).await {
            warn!("Failed to update action status: {}", e);
        }
    }
}

fn schedule_time(request: &PostRequest) -> Result<DateTime<Utc>> {
    let ts = request
        .scheduled_at
        .ok_or_else(|| CastError::InvalidInput("schedule requires --at".to_string()))?;
    let at = Utc
        .timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| CastError::InvalidInput(format!("invalid schedule timestamp {}", ts)))?;
    if at <= Utc::now() {
        return Err(CastError::InvalidInput(format!(
            "scheduled time {} is in the past",
            at.to_rfc3339()
        )));
    }
    Ok(at)
}

/// Validate a request against every platform before anything is sent
pub fn validate_all(platforms: &[Box<dyn Platform>], request: &PostRequest) -> Result<()> {
    for platform in platforms {
        platform.validate(request).map_err(|e| match e {
            CastError::Platform(PlatformError::Validation(msg)) => CastError::InvalidInput(msg),
            other => other,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;

    async fn dispatcher(platforms: Vec<Box<dyn Platform>>) -> Dispatcher {
        let db = Database::in_memory().await.unwrap();
        Dispatcher::new(platforms, db).with_retry(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_post_fans_out_to_all_networks() {
        let d = dispatcher(vec![
            Box::new(MockPlatform::ready(Network::X)),
            Box::new(MockPlatform::ready(Network::Discord)),
        ])
        .await;

        let results = d.run(Action::Post, &PostRequest::text("hello"), None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(exit_code(&results), 0);
        assert!(results[0].line().starts_with("x:mock-"));
    }

    #[tokio::test]
    async fn test_partial_failure_is_recorded() {
        let d = dispatcher(vec![
            Box::new(MockPlatform::ready(Network::X)),
            Box::new(MockPlatform::failure(Network::LinkedIn, "boom")),
        ])
        .await;

        let results = d.run(Action::Post, &PostRequest::text("hello"), None).await.unwrap();
        assert_eq!(exit_code(&results), 1);
        let failed = results.iter().find(|r| !r.success).unwrap();
        assert_eq!(failed.network, Network::LinkedIn);
        assert!(failed.error.as_deref().unwrap().contains("boom"));

        let recent = d.db.recent_actions(None, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].action.status, ActionStatus::Posted);
        assert_eq!(recent[0].records.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let flaky = MockPlatform::flaky(Network::Telegram, 2);
        let log = flaky.call_log();
        let d = dispatcher(vec![Box::new(flaky)]).await;

        let results = d.run(Action::Like, &PostRequest::default(), Some("99")).await.unwrap();
        assert!(results[0].success);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_stop_at_limit() {
        let flaky = MockPlatform::flaky(Network::Telegram, 5);
        let log = flaky.call_log();
        let d = dispatcher(vec![Box::new(flaky)]).await;

        let results = d.run(Action::Delete, &PostRequest::default(), Some("99")).await.unwrap();
        assert!(!results[0].success);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let failing = MockPlatform::failure(Network::Threads, "rejected");
        let log = failing.call_log();
        let d = dispatcher(vec![Box::new(failing)]).await;

        d.run(Action::Post, &PostRequest::text("x"), None).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_target_actions_need_id() {
        let d = dispatcher(vec![Box::new(MockPlatform::ready(Network::X))]).await;
        for action in [Action::Like, Action::Delete, Action::Share] {
            let err = d.run(action, &PostRequest::default(), None).await.unwrap_err();
            assert_eq!(err.exit_code(), 3);
        }
        let err = d.run(Action::Authorize, &PostRequest::default(), None).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_schedule_splits_native_and_queued() {
        let native = MockPlatform::ready(Network::Facebook).with_native_schedule();
        let native_log = native.call_log();
        let d = dispatcher(vec![Box::new(native), Box::new(MockPlatform::ready(Network::X))]).await;

        let mut request = PostRequest::text("later");
        request.scheduled_at = Some((Utc::now() + chrono::Duration::hours(2)).timestamp());
        let results = d.run(Action::Schedule, &request, None).await.unwrap();

        assert_eq!(native_log.lock().unwrap()[0].action, Action::Schedule);
        let queued = results.iter().find(|r| r.network == Network::X).unwrap();
        assert!(queued.queued);
        assert!(queued.line().starts_with("x:queued:"));

        let queue = d.db.list_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].networks, vec![Network::X]);
        assert_eq!(queue[0].request.content, "later");
    }

    #[tokio::test]
    async fn test_schedule_in_past_is_invalid() {
        let d = dispatcher(vec![Box::new(MockPlatform::ready(Network::X))]).await;
        let mut request = PostRequest::text("too late");
        request.scheduled_at = Some(Utc::now().timestamp() - 60);
        let err = d.run(Action::Schedule, &request, None).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_auth_only_failures() {
        let auth = CastError::Platform(PlatformError::Authentication("expired".to_string()));
        let results = vec![ActionResult::failed(Network::X, &auth)];
        assert_eq!(exit_code(&results), 2);
        assert_eq!(exit_code(&[]), 1);
    }

    #[test]
    fn test_validate_all_reports_invalid_input() {
        let platforms: Vec<Box<dyn Platform>> = vec![Box::new(MockPlatform::with_limit(Network::X, 5))];
        let err = validate_all(&platforms, &PostRequest::text("far too long")).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
