//! Core infrastructure tests.

mod common;

use std::error::Error as _;
use std::io::Write;
use tempfile::NamedTempFile;
use trellis::core::config::{Config, ConfigOverrides};
use trellis::core::error::{ErrorKind, LifecycleError, TrellisError};
use trellis::core::identity::{ClientIdentity, ClusterUri, ConnectionId, HoldToken, ServerId};
use trellis::core::runtime::{ClusterHealth, Runtime};
use trellis::entity::configuration::MemoryUnit;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_minimal_config() {
    let file = common::create_minimal_config();
    let config = common::load_config(&file);

    assert_eq!(config.cluster.name, "test-cluster");
    assert_eq!(config.cluster.servers, 2);
    assert!(config.server_resources.is_empty());
    assert!(config.client.auto_create);
    assert_eq!(config.client.max_reconnect_attempts, 3);
    assert_eq!(config.telemetry.log_level, "info");
}

#[test]
fn parse_full_config() {
    let file = common::create_config_with_settings(3, "debug");
    let config = common::load_config(&file);

    assert_eq!(config.cluster.servers, 3);
    assert_eq!(config.telemetry.log_level, "debug");
    assert_eq!(config.server_resources.len(), 2);
    assert_eq!(config.server_resources[0].unit, MemoryUnit::MB);

    let resources = config.server_resources();
    assert!(resources.contains(common::PRIMARY));
    assert_eq!(
        resources.get(common::PRIMARY).map(|r| r.capacity_bytes()),
        Some(64 * 1024 * 1024)
    );
    assert_eq!(
        config.server_side_configuration().default_server_resource.as_deref(),
        Some(common::PRIMARY)
    );
}

#[test]
fn validate_server_count_bounds() {
    let result = Config::from_toml(
        r#"
[cluster]
name = "c"
servers = 0
"#,
    );
    assert!(result.unwrap_err().to_string().contains("cluster.servers"));

    let result = Config::from_toml(
        r#"
[cluster]
name = "c"
servers = 9
"#,
    );
    assert!(result.is_err());
}

#[test]
fn validate_duplicate_server_resource() {
    let result = Config::from_toml(
        r#"
[cluster]
name = "c"

[[server_resources]]
name = "r"
size = 1

[[server_resources]]
name = "r"
size = 2
"#,
    );
    assert!(result.unwrap_err().to_string().contains("declared twice"));
}

#[test]
fn validate_default_resource_must_be_declared() {
    let result = Config::from_toml(
        r#"
[cluster]
name = "c"

[client]
default_server_resource = "missing"
"#,
    );
    assert!(result.unwrap_err().to_string().contains("missing"));
}

#[test]
fn validate_log_level() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[cluster]
name = "c"

[telemetry]
log_level = "verbose"
"#,
    )
    .unwrap();

    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("log_level"));
}

#[test]
fn missing_config_file_is_reported() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/trellis.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}

#[test]
fn overrides_replace_log_level_and_servers() {
    let mut config = common::load_config(&common::create_minimal_config());
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("trace".to_string()),
        servers: Some(4),
    });

    assert_eq!(config.telemetry.log_level, "trace");
    assert_eq!(config.cluster.servers, 4);
    assert_eq!(config.cluster_settings().servers, 4);
    config.validate().unwrap();
}

#[test]
fn derived_client_settings() {
    let config = common::load_config(&common::create_minimal_config());
    assert_eq!(config.connection_settings().request_timeout.as_millis(), 5_000);
    assert_eq!(config.connection_settings().reconnect_timeout.as_millis(), 10_000);
    assert_eq!(config.retry_policy().max_reconnect_attempts, 3);
    assert!(config.server_side_configuration().default_server_resource.is_none());
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn duplicate_tracking_message_names_client_id() {
    let client = ClientIdentity::generate();
    let cause = LifecycleError::DuplicateTracking {
        client,
        connection: ConnectionId(3),
    };
    let message = cause.to_string();
    assert!(message.contains("is already being tracked with Client Id"));
    assert!(message.contains(&client.to_string()));
}

#[test]
fn wrapped_errors_keep_kind_and_source() {
    let err = TrellisError::Destruction {
        namespace: "cm".to_string(),
        source: LifecycleError::StillReferenced {
            namespace: "cm".to_string(),
            references: 1,
        },
    };
    assert_eq!(err.kind(), ErrorKind::StillReferenced);
    assert!(!err.is_retriable());
    assert!(err.source().unwrap().to_string().contains("still referenced"));
    assert!(matches!(
        err.lifecycle_cause(),
        Some(LifecycleError::StillReferenced { references: 1, .. })
    ));
}

#[test]
fn transport_errors_are_retriable() {
    assert!(TrellisError::connection_lost("gone").is_retriable());
    assert!(TrellisError::NoActiveServer { waited_ms: 10 }.is_retriable());
    let maintenance = TrellisError::MaintenanceLeaseUnavailable {
        namespace: "cm".to_string(),
    };
    assert_eq!(maintenance.kind(), ErrorKind::MaintenanceUnavailable);
    assert!(!maintenance.is_retriable());
    assert!(maintenance.lifecycle_cause().is_none());
}

// ============================================================================
// Identity tests
// ============================================================================

#[test]
fn cluster_uri_resolves_namespaces() {
    let uri = ClusterUri::new("prod");
    assert_eq!(uri.namespace(), None);
    assert_eq!(uri.to_string(), "trellis://prod");

    let cm = uri.resolve("/destroy-CM/");
    assert_eq!(cm.cluster(), "prod");
    assert_eq!(cm.namespace(), Some("destroy-CM"));
    assert_eq!(cm, uri.resolve("destroy-CM"));
    assert_eq!(cm.to_string(), "trellis://prod/destroy-CM");
}

#[test]
fn identifiers_display() {
    assert_eq!(ServerId(2).to_string(), "server-2");
    assert_eq!(ConnectionId(7).to_string(), "conn-7");
    let owner = ClientIdentity::generate();
    assert_eq!(
        HoldToken::new(owner, 4).to_string(),
        format!("{}#4", owner)
    );
    assert_ne!(ClientIdentity::generate(), owner);
}

// ============================================================================
// Runtime tests
// ============================================================================

#[tokio::test]
async fn runtime_starts_healthy_and_stops() {
    let config = common::load_config(&common::create_config_with_settings(3, "info"));
    let mut runtime = Runtime::new(config).unwrap();
    assert_eq!(runtime.health(), ClusterHealth::Starting);

    runtime.start().await.unwrap();
    assert_eq!(runtime.health(), ClusterHealth::Healthy);
    assert!(runtime.health().is_ready());
    assert_eq!(runtime.cluster().statuses().await.len(), 3);

    runtime.stop().await;
    assert_eq!(runtime.health(), ClusterHealth::Stopped);
    assert!(runtime.cluster().statuses().await.is_empty());
}

#[tokio::test]
async fn runtime_reports_degraded_after_losing_a_server() {
    use trellis::cluster::ClusterControl;

    let config = common::load_config(&common::create_config_with_settings(3, "info"));
    let mut runtime = Runtime::new(config).unwrap();
    runtime.start().await.unwrap();

    runtime.cluster().terminate_active().await.unwrap();
    runtime.cluster().wait_for_active().await.unwrap();
    runtime.cluster().wait_for_standbys_ready().await.unwrap();

    assert_eq!(runtime.refresh_health().await, ClusterHealth::Degraded);
    runtime.stop().await;
}
