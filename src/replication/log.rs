//! Replication log.
//!
//! Every state mutation of an entity becomes one [`ReplicationEntry`] carrying
//! a sequence number that is strictly increasing per entity. The active
//! appends, standbys accept; a standby refuses any entry that is not exactly
//! the next sequence number for its entity, so gaps and reordering are
//! detected rather than silently applied.

use crate::core::error::ReplicationError;
use crate::entity::lock::LockOp;
use crate::entity::tier_manager::TierOp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Addressable server-resident entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKey {
    /// Tier manager of a namespace.
    TierManager(String),
    /// Read/write lock by name.
    Lock(String),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TierManager(ns) => write!(f, "tier-manager:{}", ns),
            Self::Lock(name) => write!(f, "lock:{}", name),
        }
    }
}

/// A replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatedOp {
    /// Tier manager mutation.
    Tier(TierOp),
    /// Lock mutation.
    Lock(LockOp),
}

impl ReplicatedOp {
    /// Entity this operation mutates.
    pub fn entity(&self) -> EntityKey {
        match self {
            Self::Tier(op) => EntityKey::TierManager(op.namespace().to_string()),
            Self::Lock(op) => EntityKey::Lock(op.lock_name().to_string()),
        }
    }
}

impl From<TierOp> for ReplicatedOp {
    fn from(op: TierOp) -> Self {
        Self::Tier(op)
    }
}

impl From<LockOp> for ReplicatedOp {
    fn from(op: LockOp) -> Self {
        Self::Lock(op)
    }
}

/// One numbered mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEntry {
    /// Entity the entry belongs to.
    pub entity: EntityKey,
    /// Per-entity sequence number, starting at 1.
    pub sequence: u64,
    /// The mutation.
    pub op: ReplicatedOp,
}

/// Per-entity sequence positions.
///
/// Positions survive entity destruction so a recreated namespace continues
/// its numbering instead of restarting at 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationLog {
    positions: BTreeMap<EntityKey, u64>,
}

impl ReplicationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next sequence number to `op` (active side).
    pub fn append(&mut self, op: ReplicatedOp) -> ReplicationEntry {
        let entity = op.entity();
        let position = self.positions.entry(entity.clone()).or_insert(0);
        *position += 1;
        ReplicationEntry {
            entity,
            sequence: *position,
            op,
        }
    }

    /// Check and record an incoming entry (standby side).
    pub fn accept(&mut self, entry: &ReplicationEntry) -> Result<(), ReplicationError> {
        let expected = self.last_sequence(&entry.entity) + 1;
        if entry.sequence != expected {
            return Err(ReplicationError::Gap {
                entity: entry.entity.clone(),
                expected,
                found: entry.sequence,
            });
        }
        self.positions.insert(entry.entity.clone(), entry.sequence);
        Ok(())
    }

    /// Last sequence number recorded for an entity (0 if none).
    pub fn last_sequence(&self, entity: &EntityKey) -> u64 {
        self.positions.get(entity).copied().unwrap_or(0)
    }

    /// Total number of entries recorded across all entities.
    pub fn total_entries(&self) -> u64 {
        self.positions.values().sum()
    }

    /// Iterate over (entity, last sequence) pairs.
    pub fn positions(&self) -> impl Iterator<Item = (&EntityKey, u64)> {
        self.positions.iter().map(|(k, v)| (k, *v))
    }
}
