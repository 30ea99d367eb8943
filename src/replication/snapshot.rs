//! Passive-sync snapshots.
//!
//! A standby joining a running active, or surviving a promotion alongside
//! the new active, is brought up to date with a full copy of the active's
//! [`ReplicaState`]. The snapshot is bincode-encoded so it crosses the same
//! boundary a real passive-sync stream would.

use super::state::ReplicaState;
use crate::core::error::ReplicationError;
use crate::core::identity::ServerId;
use serde::{Deserialize, Serialize};

/// Encoded replica state plus its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    /// Server that produced the snapshot.
    pub source: ServerId,
    /// Total entries applied on the source when the snapshot was taken.
    pub applied_entries: u64,
    /// bincode-encoded [`ReplicaState`].
    pub payload: Vec<u8>,
}

impl ReplicaSnapshot {
    /// Capture a snapshot of `state`.
    pub fn capture(source: ServerId, state: &ReplicaState) -> Result<Self, ReplicationError> {
        let payload =
            bincode::serialize(state).map_err(|e| ReplicationError::Snapshot(e.to_string()))?;
        Ok(Self {
            source,
            applied_entries: state.log().total_entries(),
            payload,
        })
    }

    /// Decode the carried state.
    pub fn restore(&self) -> Result<ReplicaState, ReplicationError> {
        bincode::deserialize(&self.payload).map_err(|e| ReplicationError::Snapshot(e.to_string()))
    }

    /// Encoded size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}
