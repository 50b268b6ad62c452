//! cast-send - Publish locally queued scheduled posts
//!
//! Networks without native scheduling get `cast-post --at` requests parked in
//! the `scheduled_queue` table. This daemon polls that queue and posts each
//! entry once it is due, honouring the hourly quotas in `[rate_limits]`.

use chrono::{TimeZone, Utc};
use clap::Parser;
use libcastkit::accounts::AccountManager;
use libcastkit::auth::AuthManager;
use libcastkit::config::Config;
use libcastkit::credentials::CredentialManager;
use libcastkit::dispatch::{create_platforms, Dispatcher};
use libcastkit::logging::LoggingConfig;
use libcastkit::rate_limiter::{window_start, HourlyQuota};
use libcastkit::types::QueuedPost;
use libcastkit::{Action, CastError, Database, Network, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Entries that keep failing are dropped after this many attempts
const MAX_ATTEMPTS: u32 = 5;

/// First retry delay for a failed entry; doubles per attempt
const RETRY_BASE_SECS: i64 = 60;

#[derive(Parser, Debug)]
#[command(name = "cast-send")]
#[command(version)]
#[command(about = "Publish locally queued scheduled posts")]
#[command(long_about = "\
cast-send - Publish locally queued scheduled posts

DESCRIPTION:
    cast-send watches the queue that `cast-post --at` fills for networks
    without native scheduling, and posts each entry when it is due.
    Failed networks are retried with backoff; entries are dropped after
    5 attempts. Hourly caps from [rate_limits] posts_per_hour delay
    entries to the next hour instead of failing them.

USAGE:
    cast-send                      # run until SIGINT/SIGTERM
    cast-send --once               # process due entries and exit
    cast-send --poll-interval 30
    cast-send --list
    cast-send --cancel <ID>

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current entry)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    3 - Invalid input (e.g. unknown queue id)
")]
struct Cli {
    /// How often to check the queue
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    poll_interval: u64,

    /// Process due entries once and exit
    #[arg(long)]
    once: bool,

    /// Show the queue and exit
    #[arg(long, conflicts_with_all = ["once", "cancel"])]
    list: bool,

    /// Remove a queued entry
    #[arg(long, value_name = "ID")]
    cancel: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    if cli.list {
        return list_queue(&db).await;
    }
    if let Some(id) = &cli.cancel {
        if !db.dequeue(id).await? {
            return Err(CastError::InvalidInput(format!("No queued post with id '{}'", id)));
        }
        println!("Cancelled {}", id);
        return Ok(());
    }

    let sender = Sender::new(config, db)?;

    if cli.once {
        let sent = sender.process_due(Utc::now().timestamp()).await?;
        info!("processed {} due entr{}", sent, if sent == 1 { "y" } else { "ies" });
        return Ok(());
    }

    info!(poll_interval = cli.poll_interval, "cast-send starting");
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    install_signal_handlers(shutdown.clone(), wake.clone())?;

    let interval = Duration::from_secs(cli.poll_interval.max(1));
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = sender.process_due(Utc::now().timestamp()).await {
            error!("Error processing queue: {}", e);
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => {}
        }
    }

    info!("cast-send stopped");
    Ok(())
}

async fn list_queue(db: &Database) -> Result<()> {
    let queue = db.list_queue().await?;
    if queue.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for entry in queue {
        let due = Utc
            .timestamp_opt(entry.due_at, 0)
            .single()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| entry.due_at.to_string());
        let networks: Vec<&str> = entry.networks.iter().map(|n| n.as_str()).collect();
        println!(
            "{}\t{}\t{}\t{}\t{}",
            entry.id,
            due,
            networks.join(","),
            entry.attempts,
            preview(&entry.request.content, 50)
        );
    }
    Ok(())
}

fn preview(content: &str, max: usize) -> String {
    let line = content.lines().next().unwrap_or("");
    if line.chars().count() > max {
        format!("{}…", line.chars().take(max).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(unix)]
fn install_signal_handlers(shutdown: Arc<AtomicBool>, wake: Arc<Notify>) -> Result<()> {
    use futures::stream::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CastError::InvalidInput(format!("Signal setup failed: {}", e)))?;
    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!(signal, "shutdown requested, finishing current work");
            shutdown.store(true, Ordering::Relaxed);
            wake.notify_one();
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn install_signal_handlers(shutdown: Arc<AtomicBool>, wake: Arc<Notify>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, finishing current work");
            shutdown.store(true, Ordering::Relaxed);
            wake.notify_one();
        }
    });
    Ok(())
}

/// What happened to one queue entry
#[derive(Debug, PartialEq)]
enum EntryOutcome {
    Sent,
    /// Held back by an hourly quota until the given time
    Throttled(i64),
    Retrying(i64),
    Dropped,
}

struct Sender {
    config: Config,
    db: Database,
    quota: HourlyQuota,
    auth: AuthManager,
    accounts: AccountManager,
}

impl Sender {
    fn new(config: Config, db: Database) -> Result<Self> {
        let quota = HourlyQuota::new(config.rate_limits.posts_per_hour.clone());
        let creds = Arc::new(CredentialManager::new(config.credential_config())?);
        let auth = AuthManager::new(config.clone(), creds)?;
        let accounts = AccountManager::new()?;
        Ok(Self {
            config,
            db,
            quota,
            auth,
            accounts,
        })
    }

    /// Post every entry due at `now`; returns how many were fully sent
    async fn process_due(&self, now: i64) -> Result<usize> {
        self.quota.cleanup_old_windows(&self.db, now - 24 * 3600).await?;

        let due = self.db.due_posts(now).await?;
        if !due.is_empty() {
            info!("{} queued entr{} due", due.len(), if due.len() == 1 { "y" } else { "ies" });
        }

        let mut sent = 0;
        for entry in due {
            match self.process_entry(&entry, now).await {
                Ok(EntryOutcome::Sent) => sent += 1,
                Ok(outcome) => info!(id = %entry.id, ?outcome, "entry not sent"),
                Err(e) => error!(id = %entry.id, "failed to process entry: {}", e),
            }
        }
        Ok(sent)
    }

    async fn process_entry(&self, entry: &QueuedPost, now: i64) -> Result<EntryOutcome> {
        for network in &entry.networks {
            if !self.quota.check(&self.db, network.as_str(), now).await? {
                let next = window_start(now) + 3600;
                warn!(%network, id = %entry.id, "hourly quota reached, holding until next hour");
                self.db.reschedule(&entry.id, next).await?;
                return Ok(EntryOutcome::Throttled(next));
            }
        }

        let platforms = match create_platforms(
            &self.config,
            &entry.networks,
            &self.auth,
            &self.accounts,
            entry.account.as_deref(),
        )
        .await
        {
            Ok(platforms) => platforms,
            Err(e) => {
                warn!(id = %entry.id, "cannot prepare networks: {}", e);
                return self.retry_or_drop(entry, &entry.networks, now).await;
            }
        };

        let mut dispatcher = Dispatcher::new(platforms, self.db.clone())
            .with_retry(self.config.defaults.retry_attempts, Duration::from_secs(1));
        if let Some(account) = &entry.account {
            dispatcher = dispatcher.with_account(account.clone());
        }

        let mut request = entry.request.clone();
        request.scheduled_at = None;
        let results = dispatcher.run(Action::Post, &request, None).await?;

        let mut failed = Vec::new();
        for result in &results {
            if result.success {
                self.quota.record(&self.db, result.network.as_str(), now).await?;
                info!("{}", result.line());
            } else {
                warn!("{}", result.line());
                failed.push(result.network);
            }
        }

        if failed.is_empty() {
            self.db.dequeue(&entry.id).await?;
            return Ok(EntryOutcome::Sent);
        }
        self.retry_or_drop(entry, &failed, now).await
    }

    /// Keep only `failed` networks in the entry and push it back with backoff
    async fn retry_or_drop(&self, entry: &QueuedPost, failed: &[Network], now: i64) -> Result<EntryOutcome> {
        let attempts = entry.attempts + 1;
        if attempts >= MAX_ATTEMPTS {
            error!(id = %entry.id, attempts, "giving up on queued entry");
            self.db.dequeue(&entry.id).await?;
            return Ok(EntryOutcome::Dropped);
        }

        let due_at = now + retry_delay(entry.attempts);
        if failed.len() == entry.networks.len() {
            self.db.defer(&entry.id, due_at).await?;
        } else {
            self.db.defer_networks(&entry.id, failed, due_at).await?;
        }
        Ok(EntryOutcome::Retrying(due_at))
    }
}

fn retry_delay(attempts: u32) -> i64 {
    RETRY_BASE_SECS * 2_i64.pow(attempts.min(10))
}
