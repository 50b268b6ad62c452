//! cast-auth - Authorization and credential management for castkit
//!
//! Runs the browser OAuth flows, stores bot tokens, and reports on what is
//! stored for each network and account.

use anyhow::Result;
use clap::{Parser, Subcommand};
use libcastkit::accounts::AccountManager;
use libcastkit::auth::{AuthManager, TokenStatus};
use libcastkit::config::{resolve_config_path, Config};
use libcastkit::credentials::CredentialManager;
use libcastkit::dispatch::create_platform;
use libcastkit::logging::LoggingConfig;
use libcastkit::{CastError, Network};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cast-auth")]
#[command(version)]
#[command(about = "Authorize castkit with social networks and manage stored tokens", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the browser OAuth flow and store the resulting token
    Authorize {
        /// Network name (x, facebook, instagram, linkedin, youtube, tiktok, threads)
        network: String,

        #[arg(long, default_value = "default")]
        account: String,

        /// Print the authorization URL without opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Store a token obtained elsewhere (bot tokens, page tokens)
    Set {
        network: String,

        #[arg(long, default_value = "default")]
        account: String,

        /// Read the token from stdin (for automation/agents)
        #[arg(long)]
        stdin: bool,
    },

    /// List stored credentials (without showing values)
    List {
        /// Only this network
        #[arg(long)]
        network: Option<String>,
    },

    /// Delete stored credentials
    Delete {
        network: String,

        #[arg(long, default_value = "default")]
        account: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Set the active account for a network
    Use {
        network: String,

        #[arg(long)]
        account: String,
    },

    /// Show token expiry and whether it can be refreshed
    Status {
        /// Only this network (default: all)
        network: Option<String>,

        #[arg(long)]
        account: Option<String>,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Refresh an OAuth2 token now
    Refresh {
        network: String,

        #[arg(long)]
        account: Option<String>,
    },

    /// Authenticate against the network with the stored credentials
    Test {
        network: Option<String>,

        #[arg(long)]
        account: Option<String>,

        /// Test every enabled network
        #[arg(short, long)]
        all: bool,
    },

    /// Write a starter config file
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.verbose).init();

    if let Err(e) = run_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        let code = e.downcast_ref::<CastError>().map(CastError::exit_code).unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Authorize {
            network,
            account,
            no_browser,
        } => authorize(&network, &account, no_browser).await,
        Commands::Set {
            network,
            account,
            stdin,
        } => set_token(&network, &account, stdin),
        Commands::List { network } => list_credentials(network.as_deref()),
        Commands::Delete {
            network,
            account,
            force,
        } => delete_credentials(&network, &account, force),
        Commands::Use { network, account } => use_account(&network, &account),
        Commands::Status {
            network,
            account,
            format,
        } => status(network.as_deref(), account.as_deref(), &format),
        Commands::Refresh { network, account } => refresh(&network, account.as_deref()).await,
        Commands::Test {
            network,
            account,
            all,
        } => {
            if all {
                test_all(account.as_deref()).await
            } else if let Some(network) = network {
                test_one(&network, account.as_deref()).await
            } else {
                Err(CastError::InvalidInput("Either specify a network or use --all".to_string()).into())
            }
        }
        Commands::Init => init(),
    }
}

struct Context {
    config: Config,
    auth: AuthManager,
    accounts: AccountManager,
    backend: String,
}

fn context() -> Result<Context> {
    let config = Config::load()?;
    let creds = CredentialManager::new(config.credential_config())?;
    let backend = creds.primary_backend().unwrap_or("unknown").to_string();
    let auth = AuthManager::new(config.clone(), Arc::new(creds))?;
    let accounts = AccountManager::new()?;
    Ok(Context {
        config,
        auth,
        accounts,
        backend,
    })
}

fn parse_network(name: &str) -> Result<Network> {
    Ok(name.parse::<Network>()?)
}

async fn authorize(network: &str, account: &str, no_browser: bool) -> Result<()> {
    let network = parse_network(network)?;
    AccountManager::validate_account_name(account)?;
    let ctx = context()?;
    let auth = if no_browser { ctx.auth.without_browser() } else { ctx.auth };

    let show_url = |url: &str| {
        eprintln!("Open this URL to authorize castkit with {}:\n\n  {}\n", network, url);
    };
    let token = auth.authorize(network, account, &show_url).await?;
    ctx.accounts.register_account(network, account)?;

    match token.expires_at {
        Some(at) => println!(
            "✓ Authorized {} account '{}' (expires {})",
            network,
            account,
            format_ts(at)
        ),
        None => println!("✓ Authorized {} account '{}'", network, account),
    }
    Ok(())
}

fn set_token(network: &str, account: &str, use_stdin: bool) -> Result<()> {
    let network = parse_network(network)?;
    AccountManager::validate_account_name(account)?;
    let ctx = context()?;

    // Refuse silent overwrites
    if ctx.auth.tokens().has_any(network, account)? {
        if use_stdin || !atty::is(atty::Stream::Stdin) {
            return Err(CastError::InvalidInput(format!(
                "Credentials for '{}' account '{}' already exist. Refusing to overwrite in non-interactive mode. \
                 Delete first with 'cast-auth delete {} --account {}'.",
                network, account, network, account
            ))
            .into());
        }
        use std::io::{self, Write};
        println!(
            "\n⚠️  A credential already exists for '{}' account '{}'. This will OVERWRITE it.",
            network, account
        );
        print!("Type 'overwrite' to confirm (or anything else to cancel): ");
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if input.trim() != "overwrite" {
            println!("Cancelled");
            return Ok(());
        }
    }

    let value = if use_stdin {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer.trim().to_string()
    } else {
        if !atty::is(atty::Stream::Stdin) {
            return Err(CastError::InvalidInput(
                "Not a TTY. Use --stdin to read the token from stdin.".to_string(),
            )
            .into());
        }
        rpassword::prompt_password(format!("Enter {} token for account '{}': ", network, account))?
    };

    ctx.auth.store_static(network, account, &value)?;
    ctx.accounts.register_account(network, account)?;
    println!(
        "✓ Stored {} token for account '{}' using {} backend",
        network, account, ctx.backend
    );
    Ok(())
}

fn list_credentials(filter: Option<&str>) -> Result<()> {
    let networks = match filter {
        Some(name) => vec![parse_network(name)?],
        None => Network::all().to_vec(),
    };
    let ctx = context()?;

    println!("Stored credentials:");
    println!();
    let mut found_any = false;

    for network in networks {
        // the keyring cannot enumerate, so the account registry is the index
        let mut accounts = ctx.accounts.list_accounts(network);
        accounts.extend(ctx.auth.tokens().accounts(network)?);
        accounts.sort();
        accounts.dedup();
        let active = ctx.accounts.active_account(network);

        for account in accounts {
            if !ctx.auth.tokens().has_any(network, &account)? {
                continue;
            }
            let marker = if account == active { " [active]" } else { "" };
            let kind = if network.uses_static_token() { "bot token" } else { "OAuth token" };
            println!(
                "  ✓ {} ({}): {} (stored in {}){}",
                network, account, kind, ctx.backend, marker
            );
            found_any = true;
        }
    }

    if !found_any {
        println!("  No credentials found.");
        println!();
        println!("Use 'cast-auth authorize <network>' or 'cast-auth set <network>' to store credentials.");
    }
    Ok(())
}

fn delete_credentials(network: &str, account: &str, force: bool) -> Result<()> {
    let network = parse_network(network)?;
    AccountManager::validate_account_name(account)?;
    let ctx = context()?;

    if !ctx.auth.tokens().has_any(network, account)? {
        println!("No credentials found for {} account '{}'", network, account);
        return Ok(());
    }

    if !force && atty::is(atty::Stream::Stdin) {
        use std::io::{self, Write};
        print!("Delete {} credentials for account '{}'? [y/N]: ", network, account);
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled");
            return Ok(());
        }
    }

    let was_active = ctx.accounts.active_account(network) == account;
    ctx.auth.revoke(network, account)?;
    ctx.accounts.unregister_account(network, account)?;
    println!("✓ Deleted {} credentials for account '{}'", network, account);

    if was_active && account != "default" {
        if ctx.auth.tokens().has_any(network, "default")? {
            ctx.accounts.set_active_account(network, "default")?;
            println!("ℹ Active account was '{}', reset to 'default'", account);
        } else {
            println!("ℹ Active account was '{}', no default account configured", account);
        }
    }
    Ok(())
}

fn use_account(network: &str, account: &str) -> Result<()> {
    let network = parse_network(network)?;
    AccountManager::validate_account_name(account)?;
    let ctx = context()?;

    if !ctx.auth.tokens().has_any(network, account)? {
        return Err(CastError::InvalidInput(format!(
            "Account '{}' not found for {}. Use 'cast-auth set {} --account {}' to create it.",
            account, network, network, account
        ))
        .into());
    }
    ctx.accounts.set_active_account(network, account)?;
    println!("✓ Set '{}' as active account for {}", account, network);
    Ok(())
}

fn status(network: Option<&str>, account: Option<&str>, format: &str) -> Result<()> {
    let networks = match network {
        Some(name) => vec![parse_network(name)?],
        None => Network::all().to_vec(),
    };
    let ctx = context()?;

    let mut statuses: Vec<TokenStatus> = Vec::new();
    for network in networks {
        let account = ctx.accounts.resolve(network, account)?;
        statuses.push(ctx.auth.status(network, &account)?);
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&statuses)?),
        "text" => {
            for s in &statuses {
                println!("{}", status_line(s));
            }
        }
        other => {
            return Err(CastError::InvalidInput(format!(
                "Invalid format '{}'. Valid formats: text, json",
                other
            ))
            .into())
        }
    }
    Ok(())
}

fn status_line(s: &TokenStatus) -> String {
    if !s.stored {
        return format!("  ✗ {} ({}): not stored", s.network, s.account);
    }
    let expiry = match s.expires_at {
        None => "does not expire".to_string(),
        Some(_) if s.expired => "expired".to_string(),
        Some(at) => format!("expires {}", format_ts(at)),
    };
    let refresh = if s.refreshable { ", refreshable" } else { "" };
    let mark = if s.expired && !s.refreshable { "✗" } else { "✓" };
    format!("  {} {} ({}): {} {}{}", mark, s.network, s.account, s.kind, expiry, refresh)
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

async fn refresh(network: &str, account: Option<&str>) -> Result<()> {
    let network = parse_network(network)?;
    let ctx = context()?;
    let account = ctx.accounts.resolve(network, account)?;
    let token = ctx.auth.refresh(network, &account).await?;
    match token.expires_at {
        Some(at) => println!("✓ Refreshed {} ({}), expires {}", network, account, format_ts(at)),
        None => println!("✓ Refreshed {} ({})", network, account),
    }
    Ok(())
}

async fn test_network(ctx: &Context, network: Network, account: Option<&str>) -> Result<()> {
    let account = ctx.accounts.resolve(network, account)?;
    let mut platform = create_platform(&ctx.config, network, &ctx.auth, &account).await?;
    platform.disconnect().await?;
    Ok(())
}

async fn test_one(network: &str, account: Option<&str>) -> Result<()> {
    let network = parse_network(network)?;
    let ctx = context()?;
    println!("Testing {} credentials...", network);
    test_network(&ctx, network, account).await?;
    println!("✓ {} authentication successful", network);
    Ok(())
}

async fn test_all(account: Option<&str>) -> Result<()> {
    let ctx = context()?;
    let networks = ctx.config.enabled_networks();
    if networks.is_empty() {
        println!("No networks are enabled in the config.");
        return Ok(());
    }

    let mut failures = 0;
    for network in networks {
        match test_network(&ctx, network, account).await {
            Ok(()) => println!("  ✓ {}", network),
            Err(e) => {
                println!("  ✗ {}: {:#}", network, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} network(s) failed authentication", failures);
    }
    Ok(())
}

fn init() -> Result<()> {
    let path = resolve_config_path()?;
    Config::write_starter(&path)?;
    println!("✓ Wrote starter config to {}", path.display());
    Ok(())
}
