//! Replication set as last published by the active.

use crate::core::identity::ServerId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Servers the active currently replicates to.
///
/// The active republishes the set whenever it changes and before it answers
/// a request that depends on the change. Once the active is lost, only the
/// members of the last published set hold every acknowledged entry, so only
/// they may be promoted.
#[derive(Debug, Clone, Default)]
pub struct InSyncRoster {
    members: Arc<Mutex<BTreeSet<ServerId>>>,
}

impl InSyncRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set.
    pub fn publish(&self, standbys: impl IntoIterator<Item = ServerId>) {
        *self.members.lock() = standbys.into_iter().collect();
    }

    /// Check whether `server` was in sync with the last active.
    pub fn contains(&self, server: ServerId) -> bool {
        self.members.lock().contains(&server)
    }

    /// Current members, ordered by id.
    pub fn members(&self) -> Vec<ServerId> {
        self.members.lock().iter().copied().collect()
    }
}
