//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/trellis.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/trellis.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration template.
    Generate {
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
        ConfigCommand::Generate { output } => generate_config(output.as_deref()),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Configuration is valid");
    println!("  cluster:          {}", config.cluster.name);
    println!(
        "  servers:          {} (1 active, {} standby)",
        config.cluster.servers,
        config.cluster.servers - 1
    );
    for resource in &config.server_resources {
        println!(
            "  server resource:  {} ({} {})",
            resource.name, resource.size, resource.unit
        );
    }
    if config.server_resources.is_empty() {
        println!("  ⚠ Warning: no server resources declared; only resource-free tier managers can be created");
    }
    if config.cluster.servers == 1 {
        println!("  ⚠ Warning: single server, failover is not possible");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}

fn generate_config(output: Option<&Path>) -> Result<()> {
    let template = template();
    match output {
        Some(path) => {
            std::fs::write(path, template)?;
            println!("Generated config template: {:?}", path);
        }
        None => println!("{}", template),
    }
    Ok(())
}

fn template() -> &'static str {
    r#"# Trellis Configuration

[cluster]
name = "trellis-dev"
servers = 2
mailbox_capacity = 64
replication_timeout_ms = 5000
promotion_timeout_ms = 10000

[[server_resources]]
name = "primary-server-resource"
unit = "MB"
size = 64

[[server_resources]]
name = "secondary-server-resource"
unit = "MB"
size = 32

[client]
auto_create = true
default_server_resource = "primary-server-resource"
request_timeout_ms = 5000
reconnect_timeout_ms = 10000
max_reconnect_attempts = 3

[telemetry]
log_level = "info"
"#
}
