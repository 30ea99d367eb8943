//! Replicated state machine.
//!
//! [`ReplicaState`] bundles every entity registry a server hosts with the
//! replication log positions. The active turns a request into a [`Plan`]
//! (operations to replicate plus the response to return once they are
//! durable); standbys only ever see [`ReplicaState::accept`].

use super::log::{ReplicatedOp, ReplicationEntry, ReplicationLog};
use crate::core::error::{LifecycleError, ReplicationError};
use crate::core::identity::{ClientIdentity, ConnectionId};
use crate::entity::configuration::ServerResources;
use crate::entity::lock::{LockDecision, LockRegistry};
use crate::entity::tier_manager::TierManagerRegistry;
use crate::entity::{EntityRequest, EntityResponse, LockOutcome};
use serde::{Deserialize, Serialize};

/// Operations to replicate and the response to return afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Operations in application order.
    pub ops: Vec<ReplicatedOp>,
    /// Response once every operation is applied.
    pub response: EntityResponse,
}

impl Plan {
    fn respond(response: EntityResponse) -> Self {
        Self {
            ops: Vec::new(),
            response,
        }
    }

    fn single(op: impl Into<ReplicatedOp>, response: EntityResponse) -> Self {
        Self {
            ops: vec![op.into()],
            response,
        }
    }

    fn maybe(op: Option<impl Into<ReplicatedOp>>, response: EntityResponse) -> Self {
        Self {
            ops: op.into_iter().map(Into::into).collect(),
            response,
        }
    }

    /// Check whether this plan mutates anything.
    pub fn is_read_only(&self) -> bool {
        self.ops.is_empty()
    }
}

/// All replicated state of one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    tiers: TierManagerRegistry,
    locks: LockRegistry,
    log: ReplicationLog,
}

impl ReplicaState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tier manager registry.
    pub fn tiers(&self) -> &TierManagerRegistry {
        &self.tiers
    }

    /// Lock registry.
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Log positions.
    pub fn log(&self) -> &ReplicationLog {
        &self.log
    }

    /// Turn a client request into a plan (active side, no mutation).
    pub fn plan(
        &self,
        request: &EntityRequest,
        client: ClientIdentity,
        connection: ConnectionId,
        resources: &ServerResources,
    ) -> Result<Plan, LifecycleError> {
        let plan = match request {
            EntityRequest::Validate {
                namespace,
                configuration,
            } => Plan::maybe(
                self.tiers
                    .plan_validate(namespace, configuration.as_ref(), client, connection)?,
                EntityResponse::Done,
            ),
            EntityRequest::Create {
                namespace,
                configuration,
            } => Plan::single(
                self.tiers
                    .plan_create(namespace, configuration, client, connection, resources)?,
                EntityResponse::Done,
            ),
            EntityRequest::Destroy { namespace } => Plan::single(
                self.tiers.plan_destroy(namespace, client)?,
                EntityResponse::Done,
            ),
            EntityRequest::Untrack { namespace } => Plan::maybe(
                self.tiers.plan_untrack(namespace, client),
                EntityResponse::Done,
            ),
            EntityRequest::ConfigureTier {
                namespace,
                tier,
                configuration,
            } => Plan::maybe(
                self.tiers
                    .plan_configure_tier(namespace, tier, configuration, resources)?,
                EntityResponse::Done,
            ),
            EntityRequest::Describe { namespace } => {
                let view = self
                    .tiers
                    .get(namespace)
                    .map(|state| state.view())
                    .ok_or_else(|| LifecycleError::NotFound {
                        namespace: namespace.clone(),
                    })?;
                Plan::respond(EntityResponse::TierManager(view))
            }
            EntityRequest::TryLock { name, mode, token } => {
                match self.locks.plan_try_lock(name, *mode, *token) {
                    LockDecision::Granted(op) => {
                        Plan::maybe(op, EntityResponse::Lock(LockOutcome::Granted))
                    }
                    LockDecision::Denied => Plan::respond(EntityResponse::Lock(LockOutcome::Denied)),
                }
            }
            EntityRequest::Unlock { name, token } => {
                let op = self.locks.plan_release(name, *token);
                let released = op.is_some();
                Plan::maybe(op, EntityResponse::Released(released))
            }
        };
        Ok(plan)
    }

    /// Plan the cleanup for a gracefully closed connection.
    ///
    /// Releases tracking bound to `connection` and every hold owned by `client`.
    pub fn plan_disconnect(&self, client: ClientIdentity, connection: ConnectionId) -> Vec<ReplicatedOp> {
        let mut ops: Vec<ReplicatedOp> = self
            .tiers
            .plan_release_connection(connection)
            .into_iter()
            .map(Into::into)
            .collect();
        ops.extend(self.locks.plan_release_owner(client).into_iter().map(Into::into));
        ops
    }

    /// Number the operation and apply it (active side).
    ///
    /// The returned entry must reach every standby before the response that
    /// depends on it is sent.
    pub fn append(&mut self, op: ReplicatedOp) -> Result<ReplicationEntry, ReplicationError> {
        self.apply_op(&op)?;
        Ok(self.log.append(op))
    }

    /// Check sequence and apply an entry from the active (standby side).
    ///
    /// A rejected operation leaves the standby diverged; it must be resynced
    /// from a snapshot before accepting further entries.
    pub fn accept(&mut self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        self.log.accept(entry)?;
        self.apply_op(&entry.op)
    }

    fn apply_op(&mut self, op: &ReplicatedOp) -> Result<(), ReplicationError> {
        let result = match op {
            ReplicatedOp::Tier(op) => self.tiers.apply(op),
            ReplicatedOp::Lock(op) => self.locks.apply(op),
        };
        result.map_err(|reason| ReplicationError::Rejected {
            entity: op.entity(),
            reason,
        })
    }
}
