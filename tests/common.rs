//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use trellis::client::{ClusteringService, ClusteringServiceConfiguration};
use trellis::cluster::{
    ClusterControl, ClusterSettings, Connection, ConnectionSettings, InProcessCluster, RetryPolicy,
};
use trellis::core::config::Config;
use trellis::core::identity::ClientIdentity;
use trellis::entity::configuration::{
    MemoryUnit, PoolDefinition, ServerResource, ServerResources, ServerSideConfiguration,
};
use trellis::server::NodeSettings;

pub const PRIMARY: &str = "primary-server-resource";
pub const SECONDARY: &str = "secondary-server-resource";

/// Create a minimal valid configuration file.
pub fn create_minimal_config() -> NamedTempFile {
    let config_content = r#"
[cluster]
name = "test-cluster"
"#;

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Create a configuration with custom settings.
pub fn create_config_with_settings(servers: u32, log_level: &str) -> NamedTempFile {
    let config_content = format!(
        r#"
[cluster]
name = "test-cluster"
servers = {}

[[server_resources]]
name = "{}"
unit = "MB"
size = 64

[[server_resources]]
name = "{}"
unit = "MB"
size = 32

[client]
default_server_resource = "{}"

[telemetry]
log_level = "{}"
"#,
        servers, PRIMARY, SECONDARY, PRIMARY, log_level
    );

    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(config_content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Load a config from a temp file.
pub fn load_config(file: &NamedTempFile) -> Config {
    Config::from_file(file.path()).expect("Failed to load config")
}

/// Server resources declared by every test cluster.
pub fn resources() -> ServerResources {
    ServerResources::new([
        ServerResource {
            name: PRIMARY.to_string(),
            unit: MemoryUnit::MB,
            size: 64,
        },
        ServerResource {
            name: SECONDARY.to_string(),
            unit: MemoryUnit::MB,
            size: 32,
        },
    ])
}

/// Server-side configuration used by test cache managers.
pub fn server_config() -> ServerSideConfiguration {
    ServerSideConfiguration::with_default_resource(PRIMARY)
        .shared_pool("shared", PoolDefinition::on_resource(SECONDARY, 8, MemoryUnit::MB))
}

/// Cluster settings with short timeouts.
pub fn cluster_settings(servers: u32) -> ClusterSettings {
    ClusterSettings {
        name: "test-cluster".to_string(),
        servers,
        node: NodeSettings {
            mailbox_capacity: 16,
            replication_timeout: Duration::from_secs(2),
        },
        promotion_timeout: Duration::from_secs(5),
    }
}

/// Connection settings with short timeouts.
pub fn connection_settings() -> ConnectionSettings {
    ConnectionSettings {
        request_timeout: Duration::from_secs(2),
        reconnect_timeout: Duration::from_secs(5),
    }
}

/// Start a cluster and wait until its standbys are in sync.
pub async fn start_cluster(servers: u32) -> InProcessCluster {
    let cluster = InProcessCluster::new(cluster_settings(servers), resources());
    cluster.start_all_servers().await.expect("servers start");
    cluster.wait_for_active().await.expect("active elected");
    cluster
        .wait_for_standbys_ready()
        .await
        .expect("standbys ready");
    cluster
}

/// Open a connection under a fresh identity.
pub async fn connect(cluster: &InProcessCluster) -> Arc<Connection> {
    let connection = cluster
        .connect(
            ClientIdentity::generate(),
            connection_settings(),
            RetryPolicy::default(),
        )
        .await
        .expect("connect");
    Arc::new(connection)
}

/// Kill the active and wait for a standby to take over.
pub async fn fail_over(cluster: &InProcessCluster) {
    let terminated = cluster.terminate_active().await.expect("terminate active");
    let promoted = cluster.wait_for_active().await.expect("promotion");
    assert_ne!(terminated, promoted);
    cluster
        .wait_for_standbys_ready()
        .await
        .expect("standbys ready after promotion");
}

/// Service configuration that auto-creates `namespace`.
pub fn auto_create(cluster: &InProcessCluster, namespace: &str) -> ClusteringServiceConfiguration {
    ClusteringServiceConfiguration::new(&cluster.uri(), namespace)
        .auto_create(server_config())
        .with_connection_settings(connection_settings())
}

/// Unstarted service that auto-creates `namespace`.
pub fn cache_manager(cluster: &InProcessCluster, namespace: &str) -> ClusteringService {
    ClusteringService::new(auto_create(cluster, namespace), cluster.directory())
}
