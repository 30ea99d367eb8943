//! Client-side proxy for a tier manager entity.

use crate::cluster::Connection;
use crate::core::error::{LifecycleError, TrellisError, TrellisResult};
use crate::entity::configuration::{ServerSideConfiguration, TierConfiguration};
use crate::entity::{EntityRequest, EntityResponse, TierManagerView};
use std::sync::Arc;

/// Proxy for the tier manager of one namespace.
///
/// Every call goes to the current active over the shared [`Connection`],
/// which re-resolves the active after a failover. Entity failures are
/// wrapped into the operation-specific [`TrellisError`] variant and keep the
/// server's [`LifecycleError`] as their source.
#[derive(Debug, Clone)]
pub struct ClusterTierManagerClient {
    connection: Arc<Connection>,
    namespace: String,
}

impl ClusterTierManagerClient {
    /// Create a proxy for `namespace`.
    pub fn new(connection: Arc<Connection>, namespace: impl Into<String>) -> Self {
        Self {
            connection,
            namespace: namespace.into(),
        }
    }

    /// Namespace this proxy addresses.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Connection the proxy uses.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Validate against the existing tier manager and track this client.
    ///
    /// With `None` only existence and tracking are checked; this is what a
    /// client that does not own the configuration uses.
    pub async fn validate(
        &self,
        configuration: Option<ServerSideConfiguration>,
    ) -> TrellisResult<()> {
        let request = EntityRequest::Validate {
            namespace: self.namespace.clone(),
            configuration,
        };
        self.invoke(request)
            .await?
            .map_err(|source| TrellisError::Validation {
                namespace: self.namespace.clone(),
                source,
            })
            .and_then(|response| self.expect_done(response))
    }

    /// Create the tier manager and track this client.
    pub async fn create(&self, configuration: ServerSideConfiguration) -> TrellisResult<()> {
        let request = EntityRequest::Create {
            namespace: self.namespace.clone(),
            configuration,
        };
        self.invoke(request)
            .await?
            .map_err(|source| TrellisError::Creation {
                namespace: self.namespace.clone(),
                source,
            })
            .and_then(|response| self.expect_done(response))
    }

    /// Destroy the tier manager.
    ///
    /// Never retried across a failover; connection loss is surfaced as is.
    pub async fn destroy(&self) -> TrellisResult<()> {
        let request = EntityRequest::Destroy {
            namespace: self.namespace.clone(),
        };
        self.invoke(request)
            .await?
            .map_err(|source| TrellisError::Destruction {
                namespace: self.namespace.clone(),
                source,
            })
            .and_then(|response| self.expect_done(response))
    }

    /// Stop tracking this client. Idempotent.
    pub async fn untrack(&self) -> TrellisResult<()> {
        let request = EntityRequest::Untrack {
            namespace: self.namespace.clone(),
        };
        self.invoke(request)
            .await?
            .map_err(|source| self.rejected("untrack", source))
            .and_then(|response| self.expect_done(response))
    }

    /// Record a cache tier and its pool allocation.
    pub async fn configure_tier(
        &self,
        tier: impl Into<String>,
        configuration: TierConfiguration,
    ) -> TrellisResult<()> {
        let request = EntityRequest::ConfigureTier {
            namespace: self.namespace.clone(),
            tier: tier.into(),
            configuration,
        };
        self.invoke(request)
            .await?
            .map_err(|source| self.rejected("configure-tier", source))
            .and_then(|response| self.expect_done(response))
    }

    /// Read the tier manager as the active sees it.
    pub async fn describe(&self) -> TrellisResult<TierManagerView> {
        let request = EntityRequest::Describe {
            namespace: self.namespace.clone(),
        };
        match self
            .invoke(request)
            .await?
            .map_err(|source| self.rejected("describe", source))?
        {
            EntityResponse::TierManager(view) => Ok(view),
            other => Err(unexpected("describe", &other)),
        }
    }

    async fn invoke(
        &self,
        request: EntityRequest,
    ) -> TrellisResult<Result<EntityResponse, LifecycleError>> {
        tracing::debug!(
            namespace = %self.namespace,
            client = %self.connection.client(),
            operation = request.operation(),
            "tier manager call"
        );
        self.connection.call(request).await
    }

    fn rejected(&self, operation: &'static str, source: LifecycleError) -> TrellisError {
        TrellisError::Rejected {
            operation,
            entity: self.namespace.clone(),
            source,
        }
    }

    fn expect_done(&self, response: EntityResponse) -> TrellisResult<()> {
        match response {
            EntityResponse::Done => Ok(()),
            other => Err(unexpected("tier manager call", &other)),
        }
    }
}

pub(crate) fn unexpected(operation: &str, response: &EntityResponse) -> TrellisError {
    TrellisError::UnexpectedResponse {
        operation: operation.to_string(),
        response: format!("{response:?}"),
    }
}
