//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI overrides.
//! Sections follow the deployment: the cluster's shape, the server resources
//! declared at bootstrap, client defaults, and telemetry.

use crate::cluster::{ClusterSettings, ConnectionSettings, RetryPolicy};
use crate::entity::configuration::{MemoryUnit, ServerResource, ServerResources, ServerSideConfiguration};
use crate::server::NodeSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Upper bound on servers per cluster (one active plus standbys).
pub const MAX_SERVERS: u32 = 8;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster shape and server timing.
    pub cluster: ClusterConfig,

    /// Offheap resources declared on every server.
    #[serde(default)]
    pub server_resources: Vec<ServerResourceConfig>,

    /// Client defaults.
    #[serde(default)]
    pub client: ClientConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name.
    pub name: String,

    /// Number of servers: one active, the rest standbys.
    #[serde(default = "default_servers")]
    pub servers: u32,

    /// Server mailbox capacity.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    /// How long the active waits for a standby acknowledgement.
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,

    /// How long promotion and standby sync may take.
    #[serde(default = "default_promotion_timeout_ms")]
    pub promotion_timeout_ms: u64,
}

/// One declared server resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResourceConfig {
    /// Resource name referenced by tier manager configurations.
    pub name: String,

    /// Unit of `size`.
    #[serde(default = "default_unit")]
    pub unit: MemoryUnit,

    /// Capacity in `unit`.
    pub size: u64,
}

/// Client defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Create missing tier managers on start.
    #[serde(default = "default_auto_create")]
    pub auto_create: bool,

    /// Default server resource of created tier managers.
    #[serde(default)]
    pub default_server_resource: Option<String>,

    /// Request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long to wait for an active to appear, in milliseconds.
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// Reconnects attempted before a call fails.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_create: default_auto_create(),
            default_server_resource: None,
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_servers() -> u32 {
    2
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_replication_timeout_ms() -> u64 {
    5_000
}

fn default_promotion_timeout_ms() -> u64 {
    10_000
}

fn default_unit() -> MemoryUnit {
    MemoryUnit::MB
}

fn default_auto_create() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_timeout_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(servers) = overrides.servers {
            self.cluster.servers = servers;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_cluster()?;
        self.validate_server_resources()?;
        self.validate_client()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_cluster(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            anyhow::bail!("cluster.name must not be empty");
        }

        if !(1..=MAX_SERVERS).contains(&self.cluster.servers) {
            anyhow::bail!(
                "cluster.servers must be between 1 and {}, got: {}",
                MAX_SERVERS,
                self.cluster.servers
            );
        }

        if self.cluster.mailbox_capacity == 0 {
            anyhow::bail!("cluster.mailbox_capacity must be > 0");
        }

        if self.cluster.replication_timeout_ms == 0 || self.cluster.promotion_timeout_ms == 0 {
            anyhow::bail!("cluster timeouts must be > 0");
        }

        Ok(())
    }

    fn validate_server_resources(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for resource in &self.server_resources {
            if resource.name.trim().is_empty() {
                anyhow::bail!("server_resources.name must not be empty");
            }
            if resource.size == 0 {
                anyhow::bail!("server resource '{}' must have a size > 0", resource.name);
            }
            if !seen.insert(resource.name.as_str()) {
                anyhow::bail!("server resource '{}' declared twice", resource.name);
            }
        }
        Ok(())
    }

    fn validate_client(&self) -> Result<()> {
        if let Some(ref resource) = self.client.default_server_resource {
            if !self.server_resources.iter().any(|r| &r.name == resource) {
                anyhow::bail!(
                    "client.default_server_resource '{}' is not a declared server resource",
                    resource
                );
            }
        }

        if self.client.request_timeout_ms == 0 || self.client.reconnect_timeout_ms == 0 {
            anyhow::bail!("client timeouts must be > 0");
        }

        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    /// Server resources declared at bootstrap.
    pub fn server_resources(&self) -> ServerResources {
        ServerResources::new(self.server_resources.iter().map(|r| ServerResource {
            name: r.name.clone(),
            unit: r.unit,
            size: r.size,
        }))
    }

    /// Settings of the in-process cluster.
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            name: self.cluster.name.clone(),
            servers: self.cluster.servers,
            node: NodeSettings {
                mailbox_capacity: self.cluster.mailbox_capacity,
                replication_timeout: Duration::from_millis(self.cluster.replication_timeout_ms),
            },
            promotion_timeout: Duration::from_millis(self.cluster.promotion_timeout_ms),
        }
    }

    /// Client connection timeouts.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            request_timeout: Duration::from_millis(self.client.request_timeout_ms),
            reconnect_timeout: Duration::from_millis(self.client.reconnect_timeout_ms),
        }
    }

    /// Client retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_reconnect_attempts: self.client.max_reconnect_attempts,
        }
    }

    /// Server-side configuration clients create tier managers with.
    pub fn server_side_configuration(&self) -> ServerSideConfiguration {
        match self.client.default_server_resource {
            Some(ref resource) => ServerSideConfiguration::with_default_resource(resource.clone()),
            None => ServerSideConfiguration::default(),
        }
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override server count.
    pub servers: Option<u32>,
}
