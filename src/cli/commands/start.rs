//! Start command implementation.

use super::super::init_tracing;
use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start an in-process cluster.
#[derive(Args, Debug)]
pub struct StartArgs {
    // No additional arguments - config is handled globally
}

/// Load configuration and apply command-line overrides.
pub fn load_config(config_path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {:?}", config_path))?;
    config.apply_overrides(overrides);
    config.validate().context("invalid configuration after overrides")?;
    Ok(config)
}

/// Run the start command with the given config path.
pub async fn run_start(
    _args: StartArgs,
    config_path: &Path,
    overrides: &ConfigOverrides,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
