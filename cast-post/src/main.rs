//! cast-post - Run one action on one or more social networks

use clap::Parser;
use libcastkit::accounts::AccountManager;
use libcastkit::auth::AuthManager;
use libcastkit::config::Config;
use libcastkit::credentials::CredentialManager;
use libcastkit::dispatch::{self, create_platforms, validate_all, Dispatcher};
use libcastkit::logging::LoggingConfig;
use libcastkit::scheduling::parse_schedule;
use libcastkit::{Action, CastError, Database, MediaSource, Network, Placement, PostRequest, Result};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cast-post")]
#[command(version)]
#[command(about = "Post, like, share, delete, upload video and schedule across social networks")]
#[command(long_about = "\
cast-post - Run one action on one or more social networks

USAGE EXAMPLES:
    cast-post \"Hello world\" --network x,linkedin
    echo \"From a pipe\" | cast-post --network telegram
    cast-post \"Launch video\" --network youtube --action video --media talk.mp4 --title \"Launch\"
    cast-post --network x --action like --id 1790000000000000000
    cast-post \"Tomorrow\" --network facebook,x --action schedule --at \"tomorrow 9am\"

OUTPUT:
    One 'network:id' line per network (text) or a JSON array (--format json).
    Queued scheduled posts print 'network:queued:ID'.

EXIT CODES:
    0 - Every network succeeded
    1 - At least one network failed
    2 - Authentication failed
    3 - Invalid input
")]
struct Cli {
    /// Content to post (reads from stdin if not provided)
    content: Option<String>,

    /// Target network(s), comma-separated (default: [defaults] networks)
    #[arg(short, long)]
    network: Option<String>,

    /// post, like, delete, share, video, schedule or authorize
    #[arg(short, long, default_value = "post")]
    action: String,

    /// Image or video path/URL (repeatable)
    #[arg(short, long)]
    media: Vec<String>,

    /// Link to attach
    #[arg(long)]
    link: Option<String>,

    /// Video title (YouTube, TikTok)
    #[arg(long)]
    title: Option<String>,

    /// Network-specific privacy value
    #[arg(long)]
    privacy: Option<String>,

    /// feed, story or reel
    #[arg(long, default_value = "feed")]
    placement: String,

    /// Target post id for like, delete and share
    #[arg(long)]
    id: Option<String>,

    /// Reply to this post id
    #[arg(long)]
    reply_to: Option<String>,

    /// When to publish: RFC 3339, "2h", "tomorrow 9am"
    #[arg(long)]
    at: Option<String>,

    /// Account name (default: active account per network)
    #[arg(long)]
    account: Option<String>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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
    let mut action: Action = cli.action.parse()?;
    if !matches!(cli.format.as_str(), "text" | "json") {
        return Err(CastError::InvalidInput(format!(
            "Invalid format '{}'. Valid formats: text, json",
            cli.format
        )));
    }

    let config = Config::load()?;
    let networks = match &cli.network {
        Some(list) => Network::parse_list(list)?,
        None => config.default_networks()?,
    };
    if networks.is_empty() {
        return Err(CastError::InvalidInput(
            "No networks selected. Use --network or set [defaults] networks".to_string(),
        ));
    }

    let scheduled_at = match &cli.at {
        Some(when) => {
            if action == Action::Post {
                action = Action::Schedule;
            }
            if action != Action::Schedule {
                return Err(CastError::InvalidInput(format!("--at cannot be used with {}", action)));
            }
            Some(parse_schedule(when)?.timestamp())
        }
        None if action == Action::Schedule => {
            return Err(CastError::InvalidInput("schedule requires --at".to_string()));
        }
        None => None,
    };
    if action.needs_target() && cli.id.as_deref().map_or(true, str::is_empty) {
        return Err(CastError::InvalidInput(format!("{} requires --id", action)));
    }

    let creds = Arc::new(CredentialManager::new(config.credential_config())?);
    let auth = AuthManager::new(config.clone(), creds)?;
    let accounts = AccountManager::new()?;

    if action == Action::Authorize {
        return authorize(&auth, &accounts, &networks, cli.account.as_deref()).await;
    }

    let content = match cli.content {
        Some(content) => content,
        None if reads_content(action) && !atty::is(atty::Stream::Stdin) => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| CastError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
            buffer.trim().to_string()
        }
        None => String::new(),
    };

    let request = PostRequest {
        content,
        media: cli.media.iter().map(|m| MediaSource::parse(m)).collect(),
        link: cli.link,
        title: cli.title,
        privacy: cli.privacy,
        placement: cli.placement.parse::<Placement>()?,
        reply_to: cli.reply_to,
        scheduled_at,
    };

    let platforms = create_platforms(&config, &networks, &auth, &accounts, cli.account.as_deref()).await?;
    if matches!(action, Action::Post | Action::Video | Action::Schedule) {
        validate_all(&platforms, &request)?;
    }

    let db = Database::new(&config.database.path).await?;
    let mut dispatcher = Dispatcher::new(platforms, db).with_retry(config.defaults.retry_attempts, Duration::from_secs(1));
    if let Some(account) = &cli.account {
        dispatcher = dispatcher.with_account(account.clone());
    }
    let results = dispatcher.run(action, &request, cli.id.as_deref()).await?;

    if cli.format == "json" {
        let json = serde_json::to_string_pretty(&results)
            .map_err(|e| CastError::InvalidInput(format!("Failed to serialize results: {}", e)))?;
        println!("{}", json);
    } else {
        for result in &results {
            if result.success {
                println!("{}", result.line());
            } else {
                eprintln!("{}", result.line());
            }
        }
    }

    Ok(dispatch::exit_code(&results))
}

fn reads_content(action: Action) -> bool {
    matches!(action, Action::Post | Action::Video | Action::Schedule | Action::Share)
}

async fn authorize(
    auth: &AuthManager,
    accounts: &AccountManager,
    networks: &[Network],
    account: Option<&str>,
) -> Result<i32> {
    let show_url = |url: &str| eprintln!("Open this URL to authorize castkit:\n\n  {}\n", url);
    for &network in networks {
        let account = accounts.resolve(network, account)?;
        auth.authorize(network, &account, &show_url).await?;
        accounts.register_account(network, &account)?;
        println!("{}:authorized:{}", network, account);
    }
    Ok(0)
}
