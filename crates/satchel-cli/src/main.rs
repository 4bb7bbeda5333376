//! Command-line driver for the Satchel offline caching layer.
//!
//! ## Usage
//!
//! ```bash
//! # Install (and activate) the configured version
//! satchel --config satchel.json install
//!
//! # Fetch through the worker, falling back to the store when offline
//! satchel fetch https://tools.example.edu/timer
//! satchel fetch --offline https://tools.example.edu/timer
//!
//! # List stores
//! satchel stores
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use satchel_common::{init_logging, LogConfig, Result, ResultExt, SatchelError};
use satchel_core::OfflineConfig;
use satchel_store::{CacheStorage, SqliteCacheStorage};
use tracing::{error, info};

mod session;

use session::Session;

#[derive(Parser)]
#[command(name = "satchel")]
#[command(about = "Offline caching layer for the tools portal")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Override the SQLite store location
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the configured version
    Install {
        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fetch URLs through the active worker
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,
        /// Treat the network as unreachable
        #[arg(long)]
        offline: bool,
    },

    /// List stores and their entry counts
    Stores,
}

fn load_config(cli: &Cli) -> Result<OfflineConfig> {
    let mut config = match &cli.config {
        Some(path) => OfflineConfig::load(path)?,
        None => {
            let mut config = OfflineConfig::default();
            config.normalize()?;
            config
        }
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.log_format = format.clone();
    }
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_logging(LogConfig::from_names(&config.log_level, &config.log_format));
    info!(
        version = %config.version,
        store = %config.store_name(),
        "Satchel starting"
    );

    let result = match cli.command {
        Commands::Install { json } => install(config, json).await,
        Commands::Fetch { urls, offline } => fetch(config, &urls, offline).await,
        Commands::Stores => stores(&config),
    };

    if let Err(ref e) = result {
        error!(category = e.category(), error = %e, "Command failed");
    }
    result
}

async fn install(config: OfflineConfig, json: bool) -> Result<()> {
    let session = Session::start(config, false).await?;
    let outcome = &session.outcome;

    if json {
        let rendered = serde_json::to_string_pretty(outcome).context("rendering reports")?;
        println!("{}", rendered);
        return Ok(());
    }

    let Some(install) = &outcome.install else {
        println!("{} already registered, nothing to install", outcome.scope);
        return Ok(());
    };

    println!("Installed {} into {}", outcome.scope, install.store);
    for url in &install.precached {
        println!("  cached   {}", url);
    }
    for (url, reason) in &install.failed {
        println!("  failed   {} ({})", url, reason);
    }

    match &outcome.activation {
        Some(activation) => {
            println!("Activated {}", activation.current);
            for name in &activation.deleted {
                println!("  purged   {}", name);
            }
            for (name, reason) in &activation.failed {
                println!("  kept     {} ({})", name, reason);
            }
        }
        None => println!("Waiting for activation"),
    }
    Ok(())
}

async fn fetch(config: OfflineConfig, urls: &[String], offline: bool) -> Result<()> {
    let session = Session::start(config, offline).await?;

    let mut failures = 0;
    for url in urls {
        match session.get(url).await {
            Ok(response) => println!(
                "{} {} {} bytes from {}",
                response.status.as_u16(),
                url,
                response.body.len(),
                response.source.as_str()
            ),
            Err(e) => {
                failures += 1;
                println!("ERR {} ({})", url, e);
            }
        }
    }

    if failures > 0 {
        return Err(SatchelError::network(format!(
            "{} of {} requests failed",
            failures,
            urls.len()
        )));
    }
    Ok(())
}

fn stores(config: &OfflineConfig) -> Result<()> {
    let storage = SqliteCacheStorage::open_path(&config.store_path)?;
    let current = config.store_name();

    let names = storage.keys()?;
    if names.is_empty() {
        println!("No stores in {}", config.store_path.display());
    }
    for name in names {
        let marker = if name == current { "*" } else { " " };
        println!("{} {} ({} entries)", marker, name, storage.entry_count(&name)?);
    }
    Ok(())
}
