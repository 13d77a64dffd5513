//! Kino CLI - Ad and ABR inspection tool
//!
//! Features:
//! - VAST tag resolution through wrapper chains
//! - VMAP schedule inspection
//! - Resolution cap computation
//! - Downswitch target selection

use clap::{Parser, Subcommand};
use kino_control::ControlConfig;
use std::path::PathBuf;

mod commands;
mod output;

/// Kino CLI - Playback control toolkit
#[derive(Parser)]
#[command(name = "kino-cli")]
#[command(author = "Purple Squirrel Media")]
#[command(version)]
#[command(about = "Ad schedule and ABR inspection toolkit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a VAST tag and show the playable creative
    Vast {
        /// VAST tag URL
        url: String,

        /// Maximum wrapper hops (overrides config)
        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Resolve a VMAP document into an ad schedule
    Vmap {
        /// VMAP URL
        url: String,

        /// Content duration in seconds, used to resolve percentage offsets
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Compute the effective resolution ceiling
    Caps {
        /// Player height in pixels
        #[arg(long)]
        viewport: Option<f64>,

        /// Connection class (slow-2g, 2g, 3g, 4g, 5g)
        #[arg(short, long)]
        network: Option<String>,

        /// Manual ceiling height
        #[arg(short, long)]
        manual: Option<u32>,
    },

    /// Pick the downswitch target for a ladder
    Downswitch {
        /// Level bandwidths in bits per second, comma separated
        #[arg(short, long, value_delimiter = ',')]
        levels: Vec<u64>,

        /// Bandwidth estimate in bits per second
        #[arg(short, long)]
        bandwidth: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();

    kino_control::init();

    let config = match &cli.config {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading config");
            ControlConfig::from_path(path)?
        }
        None => ControlConfig::default(),
    };

    match cli.command {
        Commands::Vast { url, max_depth } => {
            commands::vast(&url, max_depth, &config, &cli.format).await?;
        }
        Commands::Vmap { url, duration } => {
            commands::vmap(&url, duration, &config, &cli.format).await?;
        }
        Commands::Caps { viewport, network, manual } => {
            commands::caps(viewport, network.as_deref(), manual, &config, &cli.format)?;
        }
        Commands::Downswitch { levels, bandwidth } => {
            commands::downswitch(&levels, bandwidth, &config, &cli.format)?;
        }
    }

    Ok(())
}
