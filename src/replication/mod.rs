//! State replication between the active and its standbys.
//!
//! - [`log`] - numbered entries and per-entity sequence tracking
//! - [`state`] - the replicated state machine
//! - [`snapshot`] - full-state transfer for passive sync
//!
//! # Invariants
//!
//! - Sequence numbers strictly increase per entity and are accepted without gaps.
//! - The active answers a mutating request only after every standby accepted
//!   the corresponding entries.

pub mod log;
pub mod snapshot;
pub mod state;

pub use log::{EntityKey, ReplicatedOp, ReplicationEntry, ReplicationLog};
pub use snapshot::ReplicaSnapshot;
pub use state::{Plan, ReplicaState};
