//! Command-line interface parsing and handling
//!
//! The binary is a maintenance tool around the state core: it replays action
//! journals, inspects or clears the persisted blob, prints the resolved
//! configuration and can run a short headless session against the API.

pub mod fetch;
pub mod inspect;
pub mod replay;

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cli::fetch::run_fetch;
use crate::cli::inspect::{run_clear, run_inspect};
use crate::cli::replay::run_replay;
use crate::core::config::Config;

#[derive(Parser)]
#[command(name = "chatstate")]
#[command(version, about = "Inspect and replay the state of a messaging client")]
#[command(
    long_about = "chatstate works with the state core of a messaging client: the \
normalized entity store, its persisted blob and its action journals.\n\n\
Logging:\n\
  RUST_LOG          Overrides the log-filter configuration key (default: warn)\n\n\
Configuration is read from config.toml in the platform config directory."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a JSONL action journal into an empty store
    Replay {
        /// Journal file written by a previous session
        file: PathBuf,
        /// Write the resulting snapshot as JSON to this file
        #[arg(long, value_name = "FILE")]
        snapshot_out: Option<PathBuf>,
    },
    /// Summarize the persisted state blob
    Inspect {
        /// Directory holding the blob (defaults to the configured one)
        #[arg(long, value_name = "DIR")]
        storage: Option<PathBuf>,
    },
    /// Remove the persisted state blob
    Clear {
        #[arg(long, value_name = "DIR")]
        storage: Option<PathBuf>,
    },
    /// Print the resolved configuration
    Config,
    /// Load the chat list from the API once and persist the result
    Fetch {
        #[arg(long, value_name = "DIR")]
        storage: Option<PathBuf>,
        /// Record every applied action to this journal
        #[arg(long, value_name = "FILE")]
        journal: Option<PathBuf>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let config = Config::load()?;
    init_logging(&config);

    match args.command {
        Commands::Replay { file, snapshot_out } => {
            let summary = run_replay(&config, &file, snapshot_out.as_deref())?;
            for line in summary.describe() {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Inspect { storage } => {
            for line in run_inspect(&config, storage)? {
                println!("{line}");
            }
            Ok(())
        }
        Commands::Clear { storage } => {
            let location = run_clear(&config, storage)?;
            println!("✅ Cleared persisted state at {location}");
            Ok(())
        }
        Commands::Config => {
            config.print_all();
            println!("  build: {}", build_description());
            Ok(())
        }
        Commands::Fetch { storage, journal } => {
            let summary = run_fetch(&config, storage, journal).await?;
            println!("{summary}");
            Ok(())
        }
    }
}

/// Installs the stderr subscriber. `RUST_LOG` wins over the configured filter.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Package version plus git metadata recorded by the build script.
pub fn build_description() -> String {
    let describe = option_env!("VERGEN_GIT_DESCRIBE").unwrap_or("unknown");
    let sha = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown");
    let short_sha = sha.get(..7).unwrap_or(sha);
    format!("{} ({describe}, {short_sha})", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests;
