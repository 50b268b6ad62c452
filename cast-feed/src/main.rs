//! cast-feed - Post items from RSS, Atom and JSON feeds
//!
//! Picks the newest (or a random) unseen item from a feed, renders it through
//! a template and posts it like `cast-post` would. Posted item ids are kept in
//! the history database so a feed can be polled from cron without repeats.

use clap::Parser;
use libcastkit::accounts::AccountManager;
use libcastkit::auth::AuthManager;
use libcastkit::config::Config;
use libcastkit::credentials::CredentialManager;
use libcastkit::dispatch::{self, create_platforms, validate_all, Dispatcher};
use libcastkit::feed::{Feed, FeedItem, FeedManager, DEFAULT_TEMPLATE};
use libcastkit::http::HttpClient;
use libcastkit::logging::LoggingConfig;
use libcastkit::{Action, CastError, Database, Network, PostRequest, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "cast-feed")]
#[command(version)]
#[command(about = "Post items from RSS, Atom and JSON feeds")]
#[command(long_about = "\
cast-feed - Post items from RSS, Atom and JSON feeds

USAGE EXAMPLES:
    cast-feed https://example.com/feed.xml --network x,linkedin
    cast-feed --name blog --pick random --max-age 7d
    cast-feed --name blog --all-new --dry-run
    cast-feed ./feed.xml --list

Feeds named with --name come from [[feeds]] in the config file, which can
also set networks, template and max_age for them.

TEMPLATE PLACEHOLDERS:
    {title}, {link}, {summary}   (default: \"{title} {link}\")

EXIT CODES:
    0 - Posted (or nothing new to post)
    1 - At least one network failed
    2 - Authentication failed
    3 - Invalid input
")]
struct Cli {
    /// Feed URL or local file
    url: Option<String>,

    /// Use a feed from [[feeds]] in the config file
    #[arg(long, conflicts_with = "url")]
    name: Option<String>,

    /// Target network(s), comma-separated
    #[arg(short, long)]
    network: Option<String>,

    /// latest or random
    #[arg(long, default_value = "latest")]
    pick: String,

    /// Ignore items older than this (e.g. 24h, 7d)
    #[arg(long)]
    max_age: Option<String>,

    /// Post template
    #[arg(long)]
    template: Option<String>,

    /// Print what would be posted without posting
    #[arg(long)]
    dry_run: bool,

    /// Post every unseen item, oldest first
    #[arg(long)]
    all_new: bool,

    /// Print the feed items and exit
    #[arg(long)]
    list: bool,

    /// Account name (default: active account per network)
    #[arg(long)]
    account: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Pick {
    Latest,
    Random,
}

impl std::str::FromStr for Pick {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "latest" => Ok(Pick::Latest),
            "random" => Ok(Pick::Random),
            other => Err(CastError::InvalidInput(format!(
                "Invalid pick '{}'. Valid values: latest, random",
                other
            ))),
        }
    }
}

/// Effective options after merging the CLI with a `[[feeds]]` entry
struct FeedOptions {
    url: String,
    networks: Vec<Network>,
    template: String,
    max_age: Option<Duration>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let pick: Pick = cli.pick.parse()?;
    let config = Config::load()?;
    let options = resolve_options(&cli, &config)?;

    let feed = load_feed(&options.url, config.request_timeout()).await?;
    let items = FeedManager::recent(&feed, options.max_age, chrono::Utc::now());
    debug!(url = %options.url, total = feed.items.len(), recent = items.len(), "feed loaded");

    if cli.list {
        for item in &items {
            let published = item
                .published
                .map(|p| p.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!("{}\t{}\t{}", published, item.title, item.link.as_deref().unwrap_or(""));
        }
        return Ok(0);
    }

    let db = Database::new(&config.database.path).await?;
    let unseen = FeedManager::unseen(&db, &options.url, items).await?;
    let selected = select(unseen, pick, cli.all_new);
    if selected.is_empty() {
        eprintln!("No new items in {}", options.url);
        return Ok(0);
    }

    if cli.dry_run {
        for item in &selected {
            println!("{}", FeedManager::render(item, &options.template));
        }
        return Ok(0);
    }

    if options.networks.is_empty() {
        return Err(CastError::InvalidInput(
            "No networks selected. Use --network, the feed's networks or [defaults] networks".to_string(),
        ));
    }

    let creds = Arc::new(CredentialManager::new(config.credential_config())?);
    let auth = AuthManager::new(config.clone(), creds)?;
    let accounts = AccountManager::new()?;
    let platforms = create_platforms(&config, &options.networks, &auth, &accounts, cli.account.as_deref()).await?;

    let requests: Vec<PostRequest> = selected
        .iter()
        .map(|item| PostRequest::text(FeedManager::render(item, &options.template)))
        .collect();
    for request in &requests {
        validate_all(&platforms, request)?;
    }

    let mut dispatcher = Dispatcher::new(platforms, db.clone())
        .with_retry(config.defaults.retry_attempts, Duration::from_secs(1));
    if let Some(account) = &cli.account {
        dispatcher = dispatcher.with_account(account.clone());
    }

    let mut all_results = Vec::new();
    for (item, request) in selected.iter().zip(&requests) {
        let results = dispatcher.run(Action::Post, request, None).await?;
        for result in &results {
            if result.success {
                println!("{}", result.line());
            } else {
                eprintln!("{}", result.line());
            }
        }
        if results.iter().any(|r| r.success) {
            FeedManager::mark_seen(&db, &options.url, item).await?;
            info!(item = %item.id, "feed item posted");
        }
        all_results.extend(results);
    }

    Ok(dispatch::exit_code(&all_results))
}

fn resolve_options(cli: &Cli, config: &Config) -> Result<FeedOptions> {
    let named = match &cli.name {
        Some(name) => Some(
            config
                .feed(name)
                .ok_or_else(|| CastError::InvalidInput(format!("No feed named '{}' in config", name)))?,
        ),
        None => None,
    };

    let url = match (&cli.url, named) {
        (Some(url), _) => url.clone(),
        (None, Some(feed)) => feed.url.clone(),
        (None, None) => {
            return Err(CastError::InvalidInput("Give a feed URL or --name".to_string()));
        }
    };

    let networks = match (&cli.network, named) {
        (Some(list), _) => Network::parse_list(list)?,
        (None, Some(feed)) if !feed.networks.is_empty() => Network::parse_list(&feed.networks.join(","))?,
        _ => config.default_networks()?,
    };

    let template = cli
        .template
        .clone()
        .or_else(|| named.and_then(|f| f.template.clone()))
        .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string());

    let max_age = match cli.max_age.as_ref().or_else(|| named.and_then(|f| f.max_age.as_ref())) {
        Some(age) => Some(
            humantime::parse_duration(age)
                .map_err(|e| CastError::InvalidInput(format!("Invalid --max-age '{}': {}", age, e)))?,
        ),
        None => None,
    };

    Ok(FeedOptions {
        url,
        networks,
        template,
        max_age,
    })
}

/// Fetch over HTTP, or read a local file for anything that is not a URL
async fn load_feed(source: &str, timeout: Duration) -> Result<Feed> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let manager = FeedManager::new(HttpClient::with_timeout(timeout)?);
        return manager.fetch(source).await;
    }
    let path = shellexpand::tilde(source).to_string();
    let body = tokio::fs::read(&path)
        .await
        .map_err(|e| CastError::InvalidInput(format!("Cannot read feed '{}': {}", source, e)))?;
    FeedManager::parse(source, &body)
}

/// `items` arrive newest first
fn select(items: Vec<FeedItem>, pick: Pick, all_new: bool) -> Vec<FeedItem> {
    if all_new {
        return items.into_iter().rev().collect();
    }
    let chosen = match pick {
        Pick::Latest => FeedManager::latest(&items),
        Pick::Random => FeedManager::random(&items),
    };
    chosen.cloned().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> FeedItem {
        FeedItem {
            id: id.to_string(),
            title: id.to_string(),
            link: None,
            summary: None,
            published: None,
        }
    }

    #[test]
    fn test_select_latest_takes_first() {
        let picked = select(vec![item("new"), item("old")], Pick::Latest, false);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, "new");
    }

    #[test]
    fn test_select_all_new_is_oldest_first() {
        let picked = select(vec![item("new"), item("mid"), item("old")], Pick::Latest, true);
        let ids: Vec<_> = picked.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "mid", "new"]);
    }

    #[test]
    fn test_select_random_from_empty() {
        assert!(select(Vec::new(), Pick::Random, false).is_empty());
    }

    #[test]
    fn test_pick_parse() {
        assert_eq!("random".parse::<Pick>().unwrap(), Pick::Random);
        assert!("oldest".parse::<Pick>().is_err());
    }
}
