//! envivo - Live feed relay
//!
//! Command-line entry point: manages the filter rules of the stream and runs
//! the stream itself, printing records to the terminal and optionally relaying
//! them to a browser over a websocket.
//!
//! # Usage
//!
//! ```bash
//! # Submit the rules in rules/cats.json (validate only)
//! envivo add cats.json --dry-run
//!
//! # Show, delete, or delete every rule
//! envivo check
//! envivo delete 1234 5678
//! envivo delete-all
//!
//! # Stream to the terminal, and to ws://0.0.0.0:5000/ws
//! envivo stream --websocket
//!
//! # Verbose logging
//! RUST_LOG=debug envivo stream
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop the stream; queued relay records are still
//!   delivered before the relay closes

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use envivo_core::{EnvivoConfig, TerminalStyle, UnsetLanguagePolicy};

/// envivo - filtered stream rules and live relay
#[derive(Parser, Debug)]
#[command(name = "envivo")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ENVIVO_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[arg(short = 'l', long, env = "ENVIVO_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add the rules from a JSON rules file
    Add {
        /// Rules file; bare names are looked up in the rules directory
        file: PathBuf,

        /// Validate the rules without saving them
        #[arg(long)]
        dry_run: bool,

        /// Directory holding rules files
        #[arg(long, default_value = "rules", value_name = "DIR")]
        rules_dir: PathBuf,
    },

    /// Show the current rules
    Check,

    /// Delete rules by id
    Delete {
        /// Rule ids
        #[arg(value_name = "ID")]
        ids: Vec<String>,
    },

    /// Delete every current rule
    DeleteAll,

    /// Stream matching records
    Stream(StreamArgs),
}

/// Flags that override configuration for a stream run
#[derive(ClapArgs, Debug)]
struct StreamArgs {
    /// Relay records to a browser over a websocket
    #[arg(short = 'w', long)]
    websocket: bool,

    /// Websocket relay port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Allowed websocket origins (comma-separated)
    #[arg(long, value_name = "ORIGINS")]
    origins: Option<String>,

    /// Accepted languages (comma-separated, at least one)
    #[arg(long, value_name = "LANGS")]
    langs: Option<String>,

    /// What to do with records that carry no language (pass or drop)
    #[arg(long, value_name = "POLICY")]
    unset_lang: Option<UnsetLanguagePolicy>,

    /// Terminal output style (color, plain or json)
    #[arg(long, value_name = "STYLE")]
    style: Option<TerminalStyle>,

    /// Reconnect attempts after the stream drops (0 disables)
    #[arg(long, value_name = "N")]
    reconnect: Option<u32>,
}

impl StreamArgs {
    /// Apply flags on top of file and environment settings
    fn apply(&self, config: &mut EnvivoConfig) {
        if self.websocket {
            config.relay.enabled = true;
        }
        if let Some(port) = self.port {
            config.relay.port = port;
        }
        if let Some(origins) = &self.origins {
            config.relay.allowed_origins = split_list(origins);
        }
        if let Some(langs) = &self.langs {
            config.filter.accepted_languages = split_list(langs);
        }
        if let Some(policy) = self.unset_lang {
            config.filter.unset_language = policy;
        }
        if let Some(style) = self.style {
            config.terminal.style = style;
        }
        if let Some(attempts) = self.reconnect {
            config.reconnect.max_attempts = attempts;
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("envivo={level},envivo_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping"),
            _ = sigint.recv() => info!("Received SIGINT, stopping"),
            () = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials may live in .env; it has to be loaded before the
    // environment is read for logging or configuration.
    let dotenv = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level);

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "Ignoring unreadable .env"),
    }

    let mut config =
        EnvivoConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Command::Stream(stream_args) = &args.command {
        stream_args.apply(&mut config);
    }
    config.validate().context("Invalid configuration")?;

    match args.command {
        Command::Add {
            file,
            dry_run,
            rules_dir,
        } => commands::add(&config, &file, &rules_dir, dry_run).await,
        Command::Check => commands::check(&config).await,
        Command::Delete { ids } => commands::delete(&config, &ids).await,
        Command::DeleteAll => commands::delete_all(&config).await,
        Command::Stream(_) => {
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone())?;
            commands::stream(config, shutdown).await
        }
    }
}
