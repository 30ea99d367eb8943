//! Tier manager entity.
//!
//! One [`TierManagerState`] per namespace records the stored server-side
//! configuration, the client identities currently tracking the namespace and
//! the configured cache tiers.
//!
//! Operations are split in two phases so the active and its standbys stay
//! identical:
//! - `plan_*` inspects the current state and either rejects the request with a
//!   [`LifecycleError`] or returns the [`TierOp`] to replicate (or `None` when
//!   the request changes nothing).
//! - [`TierManagerRegistry::apply`] performs a planned operation. It is the
//!   only mutation path and is run by the active and by every standby.
//!
//! # Invariants
//!
//! - An identity is tracked at most once per namespace and is bound to the
//!   connection that tracked it.
//! - Destroy succeeds only when no identity other than the caller's is tracked.

use super::configuration::{ServerResources, ServerSideConfiguration, TierConfiguration};
use super::TierManagerView;
use crate::core::error::LifecycleError;
use crate::core::identity::{ClientIdentity, ConnectionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Replicated tier manager mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierOp {
    /// Create the namespace and track its creator.
    Create {
        namespace: String,
        configuration: ServerSideConfiguration,
        client: ClientIdentity,
        connection: ConnectionId,
    },
    /// Track a client identity.
    Track {
        namespace: String,
        client: ClientIdentity,
        connection: ConnectionId,
    },
    /// Stop tracking a client identity.
    Untrack {
        namespace: String,
        client: ClientIdentity,
    },
    /// Record a cache tier configuration.
    ConfigureTier {
        namespace: String,
        tier: String,
        configuration: TierConfiguration,
    },
    /// Remove the namespace.
    Destroy { namespace: String },
}

impl TierOp {
    /// Namespace this operation targets.
    pub fn namespace(&self) -> &str {
        match self {
            Self::Create { namespace, .. }
            | Self::Track { namespace, .. }
            | Self::Untrack { namespace, .. }
            | Self::ConfigureTier { namespace, .. }
            | Self::Destroy { namespace } => namespace,
        }
    }
}

/// State of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierManagerState {
    namespace: String,
    configuration: ServerSideConfiguration,
    tracked: BTreeMap<ClientIdentity, ConnectionId>,
    tiers: BTreeMap<String, TierConfiguration>,
}

impl TierManagerState {
    fn new(namespace: String, configuration: ServerSideConfiguration) -> Self {
        Self {
            namespace,
            configuration,
            tracked: BTreeMap::new(),
            tiers: BTreeMap::new(),
        }
    }

    /// Namespace name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Stored server-side configuration.
    pub fn configuration(&self) -> &ServerSideConfiguration {
        &self.configuration
    }

    /// Connection that tracks `client`, if any.
    pub fn tracked_by(&self, client: &ClientIdentity) -> Option<ConnectionId> {
        self.tracked.get(client).copied()
    }

    /// Number of tracked identities other than `client`.
    pub fn references_excluding(&self, client: &ClientIdentity) -> usize {
        self.tracked.keys().filter(|c| *c != client).count()
    }

    /// Number of tracked identities.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Configured tier, if present.
    pub fn tier(&self, name: &str) -> Option<&TierConfiguration> {
        self.tiers.get(name)
    }

    /// Diagnostic snapshot of this namespace.
    pub fn view(&self) -> TierManagerView {
        TierManagerView {
            namespace: self.namespace.clone(),
            configuration: self.configuration.clone(),
            tracked_clients: self.tracked.keys().copied().collect(),
            tiers: self.tiers.clone(),
        }
    }
}

/// All tier managers hosted by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierManagerRegistry {
    namespaces: BTreeMap<String, TierManagerState>,
}

impl TierManagerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a namespace.
    pub fn get(&self, namespace: &str) -> Option<&TierManagerState> {
        self.namespaces.get(namespace)
    }

    /// Check whether a namespace exists.
    pub fn exists(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Number of existing namespaces.
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Check if no namespaces exist.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    fn existing(&self, namespace: &str) -> Result<&TierManagerState, LifecycleError> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| LifecycleError::NotFound {
                namespace: namespace.to_string(),
            })
    }

    /// Plan a validate call.
    ///
    /// Fails if the identity is tracked by a different connection or the
    /// presented configuration is incompatible. Re-validating on the tracking
    /// connection plans nothing.
    pub fn plan_validate(
        &self,
        namespace: &str,
        configuration: Option<&ServerSideConfiguration>,
        client: ClientIdentity,
        connection: ConnectionId,
    ) -> Result<Option<TierOp>, LifecycleError> {
        let state = self.existing(namespace)?;

        let tracked = state.tracked_by(&client);
        if let Some(existing) = tracked {
            if existing != connection {
                return Err(LifecycleError::DuplicateTracking {
                    client,
                    connection: existing,
                });
            }
        }

        if let Some(presented) = configuration {
            presented
                .compatibility_with(&state.configuration)
                .map_err(|reason| LifecycleError::ConfigurationMismatch {
                    namespace: namespace.to_string(),
                    reason,
                })?;
        }

        Ok(tracked.is_none().then(|| TierOp::Track {
            namespace: namespace.to_string(),
            client,
            connection,
        }))
    }

    /// Plan a create call.
    pub fn plan_create(
        &self,
        namespace: &str,
        configuration: &ServerSideConfiguration,
        client: ClientIdentity,
        connection: ConnectionId,
        resources: &ServerResources,
    ) -> Result<TierOp, LifecycleError> {
        if self.exists(namespace) {
            return Err(LifecycleError::AlreadyExists {
                namespace: namespace.to_string(),
            });
        }
        configuration.check_resources(resources)?;
        Ok(TierOp::Create {
            namespace: namespace.to_string(),
            configuration: configuration.clone(),
            client,
            connection,
        })
    }

    /// Plan a destroy call.
    pub fn plan_destroy(
        &self,
        namespace: &str,
        client: ClientIdentity,
    ) -> Result<TierOp, LifecycleError> {
        let state = self.existing(namespace)?;
        let references = state.references_excluding(&client);
        if references > 0 {
            return Err(LifecycleError::StillReferenced {
                namespace: namespace.to_string(),
                references,
            });
        }
        Ok(TierOp::Destroy {
            namespace: namespace.to_string(),
        })
    }

    /// Plan an untrack call. Untracking an untracked identity, or on a missing
    /// namespace, plans nothing.
    pub fn plan_untrack(&self, namespace: &str, client: ClientIdentity) -> Option<TierOp> {
        self.namespaces
            .get(namespace)
            .and_then(|state| state.tracked_by(&client))
            .map(|_| TierOp::Untrack {
                namespace: namespace.to_string(),
                client,
            })
    }

    /// Plan a tier configuration change.
    pub fn plan_configure_tier(
        &self,
        namespace: &str,
        tier: &str,
        configuration: &TierConfiguration,
        resources: &ServerResources,
    ) -> Result<Option<TierOp>, LifecycleError> {
        let state = self.existing(namespace)?;
        match state.tier(tier) {
            Some(existing) if existing == configuration => return Ok(None),
            Some(_) => {
                return Err(LifecycleError::ConfigurationMismatch {
                    namespace: namespace.to_string(),
                    reason: format!("tier '{}' already exists with a different configuration", tier),
                })
            }
            None => {}
        }
        configuration.check(tier, &state.configuration, resources)?;
        Ok(Some(TierOp::ConfigureTier {
            namespace: namespace.to_string(),
            tier: tier.to_string(),
            configuration: configuration.clone(),
        }))
    }

    /// Plan the release of every tracking bound to a closed connection.
    pub fn plan_release_connection(&self, connection: ConnectionId) -> Vec<TierOp> {
        self.namespaces
            .values()
            .flat_map(|state| {
                state
                    .tracked
                    .iter()
                    .filter(move |(_, conn)| **conn == connection)
                    .map(|(client, _)| TierOp::Untrack {
                        namespace: state.namespace.clone(),
                        client: *client,
                    })
            })
            .collect()
    }

    /// Apply a planned operation.
    ///
    /// Returns a reason if the operation does not fit the current state, which
    /// on a standby means it has diverged from the active.
    pub fn apply(&mut self, op: &TierOp) -> Result<(), String> {
        match op {
            TierOp::Create {
                namespace,
                configuration,
                client,
                connection,
            } => {
                if self.exists(namespace) {
                    return Err(format!("namespace '{}' already exists", namespace));
                }
                let mut state = TierManagerState::new(namespace.clone(), configuration.clone());
                state.tracked.insert(*client, *connection);
                self.namespaces.insert(namespace.clone(), state);
            }
            TierOp::Track {
                namespace,
                client,
                connection,
            } => {
                self.state_mut(namespace)?.tracked.insert(*client, *connection);
            }
            TierOp::Untrack { namespace, client } => {
                self.state_mut(namespace)?.tracked.remove(client);
            }
            TierOp::ConfigureTier {
                namespace,
                tier,
                configuration,
            } => {
                self.state_mut(namespace)?
                    .tiers
                    .insert(tier.clone(), configuration.clone());
            }
            TierOp::Destroy { namespace } => {
                if self.namespaces.remove(namespace).is_none() {
                    return Err(format!("namespace '{}' does not exist", namespace));
                }
            }
        }
        Ok(())
    }

    fn state_mut(&mut self, namespace: &str) -> Result<&mut TierManagerState, String> {
        self.namespaces
            .get_mut(namespace)
            .ok_or_else(|| format!("namespace '{}' does not exist", namespace))
    }
}
