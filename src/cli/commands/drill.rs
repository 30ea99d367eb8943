//! Drill command implementation.
//!
//! Boots a cluster and walks it through a failover: two cache managers share
//! a namespace, two clients contend on a lock, the active is killed, and the
//! promoted server is checked for the same tracking and lock state.

use super::super::init_tracing;
use super::start::load_config;
use crate::client::{ClusteringService, ClusteringServiceConfiguration, ReadWriteLock};
use crate::cluster::ClusterControl;
use crate::core::config::{Config, ConfigOverrides};
use crate::core::error::TrellisError;
use crate::core::identity::{ClientIdentity, ClusterUri, ServerId};
use crate::core::runtime::Runtime;
use crate::server::NodeStatus;
use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Run the failover drill.
#[derive(Args, Debug)]
pub struct DrillArgs {
    /// Tier manager namespace used by the drill.
    #[arg(long, default_value = "drill-cache-manager")]
    pub namespace: String,

    /// Lock contended by the drill clients.
    #[arg(long, default_value = "drill-lock")]
    pub lock: String,
}

/// Outcome of every drill step.
#[derive(Debug, Clone, Serialize)]
pub struct DrillReport {
    pub cluster: String,
    pub namespace: String,
    pub auto_create: bool,
    pub initial_active: ServerId,
    pub promoted_active: ServerId,
    pub tracked_before_failover: usize,
    pub tracked_after_failover: usize,
    pub read_hold_granted: bool,
    pub write_denied_while_read_held: bool,
    pub read_hold_released_after_failover: bool,
    pub write_granted_after_release: bool,
    pub destroy_while_referenced: Option<String>,
    pub destroyed_when_unreferenced: bool,
    pub servers: Vec<NodeStatus>,
}

/// Run the drill command and print the report as JSON.
pub async fn run_drill(args: DrillArgs, config_path: &Path, overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    init_tracing(&config.telemetry.log_level);

    let report = drill(config, &args.namespace, &args.lock).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run the drill against a fresh in-process cluster.
pub async fn drill(config: Config, namespace: &str, lock: &str) -> Result<DrillReport> {
    if config.cluster.servers < 2 {
        anyhow::bail!("the drill needs at least 2 servers, got {}", config.cluster.servers);
    }

    let mut runtime = Runtime::new(config.clone())?;
    let initial_active = runtime.start().await?;
    let cluster = runtime.cluster().clone();

    let service_config = service_configuration(&config, &cluster.uri(), namespace);
    if !service_config.is_auto_create() {
        let provisioning = service_config
            .clone()
            .auto_create(config.server_side_configuration());
        let mut provisioner = ClusteringService::new(provisioning, cluster.directory());
        provisioner
            .start()
            .await
            .context("failed to provision the tier manager")?;
        provisioner.stop().await?;
    }
    let mut first = ClusteringService::new(service_config.clone(), cluster.directory());
    let mut second = ClusteringService::new(service_config, cluster.directory());
    first.start().await.context("first cache manager failed to start")?;
    second.start().await.context("second cache manager failed to start")?;

    let reader = Arc::new(
        cluster
            .connect(ClientIdentity::generate(), config.connection_settings(), config.retry_policy())
            .await?,
    );
    let writer = Arc::new(
        cluster
            .connect(ClientIdentity::generate(), config.connection_settings(), config.retry_policy())
            .await?,
    );
    let reader_lock = ReadWriteLock::new(reader, lock);
    let writer_lock = ReadWriteLock::new(writer, lock);

    let read_hold = reader_lock.try_read_lock().await?;
    let early_write = writer_lock.try_write_lock().await?;
    let write_denied_while_read_held = early_write.is_none();
    if let Some(hold) = early_write {
        hold.unlock().await?;
    }

    let tracked_before_failover = describe_tracked(&first).await?;

    let terminated = cluster.terminate_active().await?;
    tracing::info!(server = %terminated, "drill terminated the active");
    let promoted_active = cluster.wait_for_active().await?;
    cluster.wait_for_standbys_ready().await?;

    let tracked_after_failover = describe_tracked(&first).await?;

    let read_hold_granted = read_hold.is_some();
    let read_hold_released_after_failover = match read_hold {
        Some(hold) => hold.unlock().await.is_ok(),
        None => false,
    };
    let late_write = writer_lock.try_write_lock().await?;
    let write_granted_after_release = late_write.is_some();
    if let Some(hold) = late_write {
        hold.unlock().await?;
    }

    second.stop().await?;
    let destroy_while_referenced = match second.destroy().await {
        Ok(()) => None,
        Err(err) => Some(describe_error(&err)),
    };
    first.stop().await?;
    let destroyed_when_unreferenced = second.destroy().await.is_ok();

    let servers = cluster.statuses().await;
    runtime.stop().await;

    Ok(DrillReport {
        cluster: config.cluster.name.clone(),
        namespace: namespace.to_string(),
        auto_create: config.client.auto_create,
        initial_active,
        promoted_active,
        tracked_before_failover,
        tracked_after_failover,
        read_hold_granted,
        write_denied_while_read_held,
        read_hold_released_after_failover,
        write_granted_after_release,
        destroy_while_referenced,
        destroyed_when_unreferenced,
        servers,
    })
}

/// Cache manager configuration as the `[client]` section asks for it.
///
/// With `auto_create` the tier manager is created on first start; otherwise
/// it must exist and match the configured server-side configuration.
pub fn service_configuration(
    config: &Config,
    uri: &ClusterUri,
    namespace: &str,
) -> ClusteringServiceConfiguration {
    let base = ClusteringServiceConfiguration::new(uri, namespace)
        .with_connection_settings(config.connection_settings())
        .with_retry_policy(config.retry_policy());
    if config.client.auto_create {
        base.auto_create(config.server_side_configuration())
    } else {
        base.expecting(config.server_side_configuration())
    }
}

async fn describe_tracked(service: &ClusteringService) -> Result<usize> {
    let entity = service.entity().context("cache manager is not connected")?;
    Ok(entity.describe().await?.tracked_clients.len())
}

fn describe_error(err: &TrellisError) -> String {
    match err.lifecycle_cause() {
        Some(cause) => format!("{err}: {cause}"),
        None => err.to_string(),
    }
}
