//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis start --config config/trellis.toml
//!   trellis config validate --config config/trellis.toml
//!   trellis drill --config config/trellis.toml [--servers 3]

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trellis::cli::commands::{run_config, run_drill, run_start};
use trellis::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.overrides();

    // Determine config path - use global --config or default
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/trellis.toml"));

    match cli.command {
        Commands::Start(args) => run_start(args, &config_path, &overrides).await,
        Commands::Config(args) => run_config(args),
        Commands::Drill(args) => run_drill(args, &config_path, &overrides).await,
    }
}
