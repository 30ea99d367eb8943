//! Messages accepted by a server's mailbox.

use crate::core::error::{LifecycleError, ReplicationError};
use crate::core::identity::{ClientIdentity, ConnectionId, ServerId};
use crate::entity::{EntityRequest, EntityResponse};
use crate::replication::{ReplicaSnapshot, ReplicationEntry};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Role of a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRole {
    /// Authoritative; serves clients and replicates.
    Active,
    /// Mirrors the active; eligible for promotion.
    Standby,
    /// Started but not yet synced by the active.
    Unsynced,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Standby => f.write_str("standby"),
            Self::Unsynced => f.write_str("unsynced"),
        }
    }
}

/// Reply channel for client invocations.
pub type InvokeReply = oneshot::Sender<Result<EntityResponse, LifecycleError>>;

/// Acknowledgement channel for replication traffic.
pub type ReplicationAck = oneshot::Sender<Result<(), ReplicationError>>;

/// Everything a server reacts to.
#[derive(Debug)]
pub enum ServerMessage {
    /// Client request on a connection.
    Invoke {
        client: ClientIdentity,
        connection: ConnectionId,
        request: EntityRequest,
        reply: InvokeReply,
    },
    /// Graceful close of a client connection.
    Disconnect {
        client: ClientIdentity,
        connection: ConnectionId,
    },
    /// Replication entry from the active.
    Replicate {
        entry: ReplicationEntry,
        ack: ReplicationAck,
    },
    /// Full state transfer from the active.
    Sync {
        snapshot: ReplicaSnapshot,
        ack: ReplicationAck,
    },
    /// Sync a new standby and add it to the replication set.
    AttachStandby {
        link: StandbyLink,
        ack: ReplicationAck,
    },
    /// Leave the replication set. The server stops mirroring and refuses
    /// promotion until it is synced again.
    Demote,
    /// Become active with the given standbys. Only a synced standby accepts.
    Promote {
        standbys: Vec<StandbyLink>,
        ack: oneshot::Sender<NodeStatus>,
    },
    /// Report status.
    Status { reply: oneshot::Sender<NodeStatus> },
    /// Fault injection: after handling the next request for `operation`,
    /// stop without replying, as if the process died.
    CrashOn {
        operation: &'static str,
        ack: oneshot::Sender<()>,
    },
}

/// Mailbox of a standby as seen by the active.
#[derive(Debug, Clone)]
pub struct StandbyLink {
    /// Standby server id.
    pub server: ServerId,
    /// Standby mailbox.
    pub mailbox: mpsc::Sender<ServerMessage>,
}

/// Point-in-time status of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Server id.
    pub server: ServerId,
    /// Current role.
    pub role: ServerRole,
    /// Total replication entries applied.
    pub applied_entries: u64,
    /// Number of existing tier managers.
    pub namespaces: usize,
    /// Number of held locks.
    pub locks: usize,
    /// Standbys in the replication set (active only).
    pub standbys: Vec<ServerId>,
}
