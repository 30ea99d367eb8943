//! Clustering service: client lifecycle around one tier manager.
//!
//! ```text
//! Unstarted --start--> Started --> Validated | Created --stop--> Stopped
//! Unstarted --start_for_maintenance--> MaintenanceStarted --stop--> Stopped
//! ```
//!
//! Maintenance mode holds the write side of the namespace's access lock, so
//! no other client can start normally while it lasts. A normal start takes
//! the read side for the duration of validate/create.

use super::entity::ClusterTierManagerClient;
use super::lock::{Hold, ReadWriteLock};
use crate::cluster::{ClusterDirectory, Connection, ConnectionSettings, RetryPolicy};
use crate::core::error::{ErrorKind, TrellisError, TrellisResult};
use crate::core::identity::{ClientIdentity, ClusterUri};
use crate::entity::configuration::{ServerSideConfiguration, TierConfiguration};
use std::fmt;
use std::sync::Arc;

/// Lifecycle phase of a [`ClusteringService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Unstarted,
    Started,
    Validated,
    Created,
    MaintenanceStarted,
    Stopped,
}

impl ServicePhase {
    fn is_idle(self) -> bool {
        matches!(self, Self::Unstarted | Self::Stopped)
    }

    fn is_serving(self) -> bool {
        matches!(self, Self::Started | Self::Validated | Self::Created)
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Started => "started",
            Self::Validated => "validated",
            Self::Created => "created",
            Self::MaintenanceStarted => "in maintenance",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Name of the lock guarding access to a namespace.
pub fn access_lock_name(namespace: &str) -> String {
    format!("tier-manager-access:{namespace}")
}

/// Client-side configuration of a clustering service.
#[derive(Debug, Clone)]
pub struct ClusteringServiceConfiguration {
    uri: ClusterUri,
    namespace: String,
    auto_create: bool,
    server_config: Option<ServerSideConfiguration>,
    connection: ConnectionSettings,
    retry: RetryPolicy,
}

impl ClusteringServiceConfiguration {
    /// Address the tier manager `namespace` on `cluster`. Validates only,
    /// without a configuration.
    pub fn new(cluster: &ClusterUri, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            uri: cluster.resolve(&namespace),
            namespace,
            auto_create: false,
            server_config: None,
            connection: ConnectionSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Create the tier manager on start if it is missing.
    pub fn auto_create(mut self, server_config: ServerSideConfiguration) -> Self {
        self.auto_create = true;
        self.server_config = Some(server_config);
        self
    }

    /// Expect an existing tier manager with this configuration.
    pub fn expecting(mut self, server_config: ServerSideConfiguration) -> Self {
        self.auto_create = false;
        self.server_config = Some(server_config);
        self
    }

    /// Override connection timeouts.
    pub fn with_connection_settings(mut self, settings: ConnectionSettings) -> Self {
        self.connection = settings;
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Full URI, including the namespace.
    pub fn uri(&self) -> &ClusterUri {
        &self.uri
    }

    /// Namespace of the tier manager.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether start creates a missing tier manager.
    pub fn is_auto_create(&self) -> bool {
        self.auto_create
    }

    /// Server-side configuration, if any.
    pub fn server_config(&self) -> Option<&ServerSideConfiguration> {
        self.server_config.as_ref()
    }
}

/// Client lifecycle around the tier manager of one namespace.
pub struct ClusteringService {
    configuration: ClusteringServiceConfiguration,
    directory: Arc<ClusterDirectory>,
    identity: ClientIdentity,
    phase: ServicePhase,
    entity: Option<ClusterTierManagerClient>,
    maintenance: Option<Hold>,
}

impl ClusteringService {
    /// Create an unstarted service with a fresh client identity.
    pub fn new(configuration: ClusteringServiceConfiguration, directory: Arc<ClusterDirectory>) -> Self {
        Self::with_identity(configuration, directory, ClientIdentity::generate())
    }

    /// Create an unstarted service acting as `identity`.
    pub fn with_identity(
        configuration: ClusteringServiceConfiguration,
        directory: Arc<ClusterDirectory>,
        identity: ClientIdentity,
    ) -> Self {
        Self {
            configuration,
            directory,
            identity,
            phase: ServicePhase::Unstarted,
            entity: None,
            maintenance: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ServicePhase {
        self.phase
    }

    /// Identity this service is tracked under.
    pub fn identity(&self) -> ClientIdentity {
        self.identity
    }

    /// Service configuration.
    pub fn configuration(&self) -> &ClusteringServiceConfiguration {
        &self.configuration
    }

    /// Tier manager proxy while connected. For diagnostics and tests.
    pub fn entity(&self) -> Option<&ClusterTierManagerClient> {
        self.entity.as_ref()
    }

    /// Handle on a named lock over this service's connection.
    pub fn lock(&self, name: impl Into<String>) -> TrellisResult<ReadWriteLock> {
        let entity = self.entity.as_ref().ok_or_else(|| self.invalid_phase("lock"))?;
        Ok(ReadWriteLock::new(entity.connection().clone(), name))
    }

    /// Connect, then validate or create the tier manager.
    pub async fn start(&mut self) -> TrellisResult<()> {
        if !self.phase.is_idle() {
            return Err(self.invalid_phase("start"));
        }
        let previous = self.phase;
        let namespace = self.configuration.namespace.clone();
        let connection = self.connect().await?;
        self.phase = ServicePhase::Started;

        let entity = ClusterTierManagerClient::new(connection.clone(), namespace.clone());
        let access = ReadWriteLock::new(connection.clone(), access_lock_name(&namespace));
        let outcome = match access.try_read_lock().await {
            Ok(Some(hold)) => {
                let outcome = self.establish(&entity).await;
                if let Err(cause) = &outcome {
                    // A create or validate that took effect before a lost reply
                    // may have tracked this identity under the old connection.
                    if let Err(err) = entity.untrack().await {
                        tracing::warn!(
                            namespace = %namespace,
                            cause = %cause,
                            error = %err,
                            "failed to untrack after failed start"
                        );
                    }
                }
                if let Err(err) = hold.unlock().await {
                    tracing::warn!(namespace = %namespace, error = %err, "failed to release access hold");
                }
                outcome
            }
            Ok(None) => Err(TrellisError::MaintenanceInProgress {
                namespace: namespace.clone(),
            }),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(phase) => {
                self.phase = phase;
                self.entity = Some(entity);
                tracing::info!(
                    namespace = %namespace,
                    client = %self.identity,
                    phase = %phase,
                    "clustering service started"
                );
                Ok(())
            }
            Err(err) => {
                connection.close();
                self.phase = previous;
                Err(err)
            }
        }
    }

    async fn establish(&self, entity: &ClusterTierManagerClient) -> TrellisResult<ServicePhase> {
        let server_config = self.configuration.server_config.clone();
        match server_config {
            Some(config) if self.configuration.auto_create => {
                match entity.create(config.clone()).await {
                    Ok(()) => Ok(ServicePhase::Created),
                    Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                        entity.validate(Some(config)).await?;
                        Ok(ServicePhase::Validated)
                    }
                    Err(err) => Err(err),
                }
            }
            config => {
                entity.validate(config).await?;
                Ok(ServicePhase::Validated)
            }
        }
    }

    /// Connect for administration, holding the maintenance lease.
    pub async fn start_for_maintenance(&mut self) -> TrellisResult<()> {
        if !self.phase.is_idle() {
            return Err(self.invalid_phase("start for maintenance"));
        }
        let namespace = self.configuration.namespace.clone();
        let connection = self.connect().await?;

        let access = ReadWriteLock::new(connection.clone(), access_lock_name(&namespace));
        let hold = match access.try_write_lock().await {
            Ok(Some(hold)) => hold,
            Ok(None) => {
                connection.close();
                return Err(TrellisError::MaintenanceLeaseUnavailable { namespace });
            }
            Err(err) => {
                connection.close();
                return Err(err);
            }
        };

        self.maintenance = Some(hold);
        self.entity = Some(ClusterTierManagerClient::new(connection, namespace.clone()));
        self.phase = ServicePhase::MaintenanceStarted;
        tracing::info!(namespace = %namespace, client = %self.identity, "maintenance started");
        Ok(())
    }

    /// Destroy the tier manager. Only valid in maintenance mode.
    ///
    /// A missing tier manager is not an error.
    pub async fn destroy_all(&mut self) -> TrellisResult<()> {
        let entity = match (&self.entity, self.phase) {
            (Some(entity), ServicePhase::MaintenanceStarted) => entity,
            _ => return Err(self.invalid_phase("destroy all")),
        };
        match entity.destroy().await {
            Ok(()) => {
                tracing::info!(namespace = %entity.namespace(), "tier manager destroyed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(namespace = %entity.namespace(), "nothing to destroy");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Untrack or release the maintenance lease, then close the connection.
    ///
    /// Stopping an idle service does nothing.
    pub async fn stop(&mut self) -> TrellisResult<()> {
        if self.phase.is_idle() {
            return Ok(());
        }
        let Some(entity) = self.entity.take() else {
            self.phase = ServicePhase::Stopped;
            return Ok(());
        };

        let result = if self.phase.is_serving() {
            entity.untrack().await
        } else if let Some(hold) = self.maintenance.take() {
            hold.unlock().await
        } else {
            Ok(())
        };

        entity.connection().close();
        self.phase = ServicePhase::Stopped;
        tracing::info!(namespace = %entity.namespace(), client = %self.identity, "clustering service stopped");
        result
    }

    /// Destroy the tier manager from an idle service: enter maintenance,
    /// destroy, stop.
    pub async fn destroy(&mut self) -> TrellisResult<()> {
        if !self.phase.is_idle() {
            return Err(self.invalid_phase("destroy"));
        }
        self.start_for_maintenance().await?;
        let destroyed = self.destroy_all().await;
        let stopped = self.stop().await;
        destroyed.and(stopped)
    }

    /// Record a cache tier on the tier manager.
    pub async fn create_tier(
        &self,
        tier: impl Into<String>,
        configuration: TierConfiguration,
    ) -> TrellisResult<()> {
        match (&self.entity, self.phase) {
            (Some(entity), ServicePhase::Validated | ServicePhase::Created) => {
                entity.configure_tier(tier, configuration).await
            }
            _ => Err(self.invalid_phase("create tier")),
        }
    }

    async fn connect(&self) -> TrellisResult<Arc<Connection>> {
        let connection = Connection::connect(
            self.directory.clone(),
            self.identity,
            self.configuration.connection.clone(),
            self.configuration.retry,
        )
        .await?;
        Ok(Arc::new(connection))
    }

    fn invalid_phase(&self, operation: &'static str) -> TrellisError {
        TrellisError::InvalidPhase {
            operation,
            phase: self.phase.to_string(),
        }
    }
}
