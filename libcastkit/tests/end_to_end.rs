//! End-to-end workflow tests for multi-network dispatch
//!
//! These tests drive the dispatcher against mock adapters and a real SQLite
//! file, covering:
//! - Posting to several networks at once
//! - Partial failures and the resulting exit code
//! - Scheduling with native and queued networks
//! - Querying history after the fact

use anyhow::Result;
use libcastkit::config::Config;
use libcastkit::db::Database;
use libcastkit::dispatch::{self, validate_all, Dispatcher};
use libcastkit::platforms::mock::MockPlatform;
use libcastkit::platforms::Platform;
use libcastkit::types::ActionStatus;
use libcastkit::{Action, Network, PostRequest};
use std::time::Duration;
use tempfile::TempDir;

async fn create_test_db() -> Result<(TempDir, Database)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("history.db");
    let db = Database::new(&db_path.to_string_lossy()).await?;
    Ok((temp_dir, db))
}

fn fast(dispatcher: Dispatcher) -> Dispatcher {
    dispatcher.with_retry(3, Duration::from_millis(1))
}

#[tokio::test]
async fn test_post_to_every_network() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let platforms: Vec<Box<dyn Platform>> = vec![
        Box::new(MockPlatform::ready(Network::X)),
        Box::new(MockPlatform::ready(Network::LinkedIn)),
        Box::new(MockPlatform::ready(Network::Telegram)),
    ];
    let dispatcher = fast(Dispatcher::new(platforms, db.clone()));

    let request = PostRequest::text("Hello everywhere").with_link("https://example.com");
    let results = dispatcher.run(Action::Post, &request, None).await?;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.success && r.outcome.is_some()));
    assert_eq!(dispatch::exit_code(&results), 0);

    let history = db.recent_actions(None, 10).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action.status, ActionStatus::Posted);
    assert_eq!(history[0].action.content, "Hello everywhere https://example.com");
    assert_eq!(history[0].records.len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_partial_failure_is_recorded() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let platforms: Vec<Box<dyn Platform>> = vec![
        Box::new(MockPlatform::ready(Network::X)),
        Box::new(MockPlatform::failure(Network::Facebook, "page not found")),
    ];
    let dispatcher = fast(Dispatcher::new(platforms, db.clone()));

    let results = dispatcher.run(Action::Post, &PostRequest::text("half"), None).await?;
    assert_eq!(dispatch::exit_code(&results), 1);

    let failed = results.iter().find(|r| r.network == Network::Facebook).unwrap();
    assert!(!failed.success);
    assert!(failed.line().starts_with("facebook:error:"));
    assert!(failed.error.as_deref().unwrap().contains("page not found"));

    let history = db.recent_actions(Some(Network::Facebook), 10).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action.status, ActionStatus::Posted);
    let record = history[0].records.iter().find(|r| r.network == "facebook").unwrap();
    assert!(!record.success);
    assert!(record.completed_at.is_none());
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let flaky = MockPlatform::flaky(Network::Discord, 2);
    let log = flaky.call_log();
    let dispatcher = fast(Dispatcher::new(vec![Box::new(flaky)], db));

    let results = dispatcher.run(Action::Post, &PostRequest::text("third time"), None).await?;
    assert!(results[0].success);
    assert_eq!(log.lock().unwrap().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_like_and_delete_use_target() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let mock = MockPlatform::ready(Network::Threads);
    let log = mock.call_log();
    let dispatcher = fast(Dispatcher::new(vec![Box::new(mock)], db.clone()));

    let liked = dispatcher.run(Action::Like, &PostRequest::default(), Some("1789")).await?;
    assert_eq!(liked[0].line(), "threads:1789");
    dispatcher.run(Action::Delete, &PostRequest::default(), Some("1789")).await?;

    let calls = log.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].action, Action::Like);
    assert_eq!(calls[1].action, Action::Delete);
    assert_eq!(calls[1].target.as_deref(), Some("1789"));

    let history = db.recent_actions(None, 10).await?;
    assert!(history.iter().all(|h| h.action.target.as_deref() == Some("1789")));
    Ok(())
}

#[tokio::test]
async fn test_schedule_splits_native_and_queued() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let native = MockPlatform::ready(Network::YouTube).with_native_schedule();
    let native_log = native.call_log();
    let platforms: Vec<Box<dyn Platform>> = vec![
        Box::new(native),
        Box::new(MockPlatform::ready(Network::X)),
        Box::new(MockPlatform::ready(Network::Telegram)),
    ];
    let dispatcher = fast(Dispatcher::new(platforms, db.clone())).with_account("work");

    let due = chrono::Utc::now().timestamp() + 7200;
    let request = PostRequest {
        scheduled_at: Some(due),
        ..PostRequest::text("later")
    };
    let results = dispatcher.run(Action::Schedule, &request, None).await?;

    assert_eq!(results.len(), 3);
    assert_eq!(native_log.lock().unwrap()[0].action, Action::Schedule);
    let queued: Vec<_> = results.iter().filter(|r| r.queued).collect();
    assert_eq!(queued.len(), 2);

    let queue = db.list_queue().await?;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].networks, vec![Network::X, Network::Telegram]);
    assert_eq!(queue[0].due_at, due);
    assert_eq!(queue[0].account.as_deref(), Some("work"));
    assert_eq!(queued[0].line(), format!("x:queued:{}", queue[0].id));

    let history = db.recent_actions(None, 1).await?;
    assert_eq!(history[0].action.status, ActionStatus::Scheduled);
    assert!(history[0].records.iter().all(|r| r.account_name == "work"));
    Ok(())
}

#[tokio::test]
async fn test_schedule_in_past_is_rejected() -> Result<()> {
    let (_temp_dir, db) = create_test_db().await?;
    let dispatcher = fast(Dispatcher::new(vec![Box::new(MockPlatform::ready(Network::X))], db.clone()));

    let request = PostRequest {
        scheduled_at: Some(chrono::Utc::now().timestamp() - 60),
        ..PostRequest::text("too late")
    };
    let err = dispatcher.run(Action::Schedule, &request, None).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(db.list_queue().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_validation_runs_before_dispatch() -> Result<()> {
    let platforms: Vec<Box<dyn Platform>> = vec![
        Box::new(MockPlatform::ready(Network::X)),
        Box::new(MockPlatform::with_limit(Network::Telegram, 10)),
    ];
    let err = validate_all(&platforms, &PostRequest::text("this is far too long")).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(validate_all(&platforms, &PostRequest::text("short")).is_ok());
    Ok(())
}

#[test]
fn test_config_with_every_section() {
    let config = Config::parse(
        r#"
[database]
path = "/tmp/castkit-test/history.db"

[defaults]
networks = ["x", "tg"]
retry_attempts = 5

[rate_limits.posts_per_hour]
x = 50

[x]
api_key = "k"
api_secret = "s"

[telegram]
chat_id = "@news"

[youtube]
client_id = "id"
client_secret = "secret"

[[feeds]]
name = "blog"
url = "https://example.com/feed.xml"
max_age = "24h"
"#,
    )
    .unwrap();

    assert_eq!(config.defaults.retry_attempts, 5);
    assert_eq!(config.default_networks().unwrap(), vec![Network::X, Network::Telegram]);
    assert!(config.is_enabled(Network::YouTube));
    assert!(!config.is_enabled(Network::Discord));
    assert_eq!(config.rate_limits.posts_per_hour.get("x"), Some(&50));
    assert_eq!(config.feed("blog").unwrap().max_age.as_deref(), Some("24h"));
}

#[test]
fn test_config_rejects_unknown_default_network() {
    let err = Config::parse("[defaults]\nnetworks = [\"myspace\"]\n").unwrap_err();
    assert_eq!(err.exit_code(), 3);
}
