//! Runtime orchestration.
//!
//! The runtime boots an in-process cluster from [`Config`]:
//! - Start: spawn every server, wait for the active, wait for standbys to sync
//! - Shutdown: withdraw the active endpoint, terminate every server

use crate::cluster::{ClusterControl, InProcessCluster};
use crate::core::config::Config;
use crate::core::identity::ServerId;
use crate::server::{NodeStatus, ServerRole};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Cluster health as seen by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    /// Servers are starting.
    Starting,
    /// An active and every configured standby are serving.
    Healthy,
    /// An active is serving with fewer standbys than configured.
    Degraded,
    /// No active server.
    Unavailable,
    /// The cluster was shut down.
    Stopped,
}

impl ClusterHealth {
    /// Derive health from server statuses.
    pub fn assess(statuses: &[NodeStatus], configured: u32) -> Self {
        let Some(active) = statuses.iter().find(|s| s.role == ServerRole::Active) else {
            return Self::Unavailable;
        };
        if active.standbys.len() + 1 >= configured as usize {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }

    /// Check if clients can be served.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// Trellis runtime holding the cluster.
pub struct Runtime {
    config: Arc<Config>,
    cluster: Arc<InProcessCluster>,
    health: ClusterHealth,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let cluster = InProcessCluster::new(config.cluster_settings(), config.server_resources());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            cluster: Arc::new(cluster),
            health: ClusterHealth::Starting,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The cluster managed by this runtime.
    pub fn cluster(&self) -> &Arc<InProcessCluster> {
        &self.cluster
    }

    /// Health as of the last start or refresh.
    pub fn health(&self) -> ClusterHealth {
        self.health
    }

    /// Re-read server statuses and update health.
    pub async fn refresh_health(&mut self) -> ClusterHealth {
        if self.health != ClusterHealth::Stopped {
            let statuses = self.cluster.statuses().await;
            self.health = ClusterHealth::assess(&statuses, self.config.cluster.servers);
        }
        self.health
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start every server and wait until the cluster is in sync.
    pub async fn start(&mut self) -> Result<ServerId> {
        tracing::info!(
            cluster = %self.config.cluster.name,
            servers = self.config.cluster.servers,
            resources = self.config.server_resources.len(),
            "starting Trellis runtime"
        );

        self.cluster
            .start_all_servers()
            .await
            .context("failed to start servers")?;
        let active = self.cluster.wait_for_active().await?;
        self.cluster.wait_for_standbys_ready().await?;

        self.refresh_health().await;
        tracing::info!(active = %active, health = ?self.health, "Trellis runtime started");
        Ok(active)
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c or [`Runtime::shutdown`].
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Terminate every server.
    pub async fn stop(&mut self) {
        tracing::info!("stopping Trellis runtime");
        let _ = self.shutdown_tx.send(true);
        self.cluster.shutdown().await;
        self.health = ClusterHealth::Stopped;
        tracing::info!("Trellis runtime stopped");
    }
}
