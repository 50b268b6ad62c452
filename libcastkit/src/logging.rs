//! Logging setup shared by the cast-* binaries
//!
//! All output goes to stderr so that stdout stays reserved for results
//! (`network:id` lines or JSON) and the tools compose in pipelines.
//!
//! ```no_run
//! use libcastkit::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "info".to_string(), false).init();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "CASTKIT_LOG_FORMAT";
pub const ENV_LOG_LEVEL: &str = "CASTKIT_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain lines, no colors
    #[default]
    Text,
    /// One JSON object per event
    Json,
    /// Multi-line colored output for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    /// `verbose` raises the default level to debug; `RUST_LOG` still wins
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Build the config from `CASTKIT_LOG_FORMAT` / `CASTKIT_LOG_LEVEL`
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var(ENV_LOG_FORMAT)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let level = std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "warn".to_string());
        Self::new(format, level, verbose)
    }

    fn filter(&self) -> EnvFilter {
        let fallback = if self.verbose { "debug" } else { self.level.as_str() };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
    }

    /// Install the global subscriber. Safe to call twice; the second call is a no-op.
    pub fn init(&self) {
        let filter = self.filter();
        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .flatten_event(true)
                .with_current_span(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_file(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .try_init(),
        };
        if let Err(e) = result {
            tracing::debug!("Logging already initialized: {}", e);
        }
    }
}
