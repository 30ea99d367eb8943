//! Error types.
//!
//! Three layers:
//! - [`LifecycleError`] - raised by the server-resident entities. Serializable,
//!   so it crosses the connection unchanged.
//! - [`ReplicationError`] - raised between the active and its standbys.
//! - [`TrellisError`] - what client code sees. Entity failures are wrapped with
//!   the failing operation and keep the [`LifecycleError`] as their source.

use crate::core::identity::{ClientIdentity, ConnectionId, ServerId};
use crate::replication::log::EntityKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures of tier-manager and lock entity operations.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LifecycleError {
    /// The identity is tracked by another session of the same namespace.
    #[error("Client {connection} is already being tracked with Client Id {client}")]
    DuplicateTracking {
        client: ClientIdentity,
        connection: ConnectionId,
    },

    /// The stored server-side configuration disagrees with the client's.
    #[error("configuration mismatch for tier manager '{namespace}': {reason}")]
    ConfigurationMismatch { namespace: String, reason: String },

    /// Destroy attempted while other clients still track the namespace.
    #[error("tier manager '{namespace}' is still referenced by {references} client(s)")]
    StillReferenced { namespace: String, references: usize },

    /// Create attempted on an existing namespace.
    #[error("tier manager '{namespace}' already exists")]
    AlreadyExists { namespace: String },

    /// Operation on a namespace that does not exist.
    #[error("tier manager '{namespace}' does not exist")]
    NotFound { namespace: String },

    /// Configuration references undeclared or invalid server resources.
    #[error("invalid server resource configuration: {reason}")]
    InvalidServerResource { reason: String },

    /// The receiving server is not the active.
    #[error("{server} is not active")]
    NotActive { server: ServerId },
}

impl LifecycleError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateTracking { .. } => ErrorKind::DuplicateTracking,
            Self::ConfigurationMismatch { .. } => ErrorKind::ConfigurationMismatch,
            Self::StillReferenced { .. } => ErrorKind::StillReferenced,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidServerResource { .. } => ErrorKind::InvalidServerResource,
            Self::NotActive { .. } => ErrorKind::ConnectionLost,
        }
    }
}

/// Failures while mirroring state to a standby.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// An entry arrived out of sequence.
    #[error("replication gap on {entity}: expected sequence {expected}, received {found}")]
    Gap {
        entity: EntityKey,
        expected: u64,
        found: u64,
    },

    /// Replication message delivered to a server that is not a standby.
    #[error("{server} is not a standby")]
    NotStandby { server: ServerId },

    /// A replicated operation could not be applied to the mirror.
    #[error("replicated operation on {entity} rejected: {reason}")]
    Rejected { entity: EntityKey, reason: String },

    /// Passive-sync snapshot could not be encoded or decoded.
    #[error("snapshot codec failure: {0}")]
    Snapshot(String),
}

/// Coarse classification used by callers to branch on failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DuplicateTracking,
    ConfigurationMismatch,
    StillReferenced,
    AlreadyExists,
    NotFound,
    InvalidServerResource,
    ConnectionLost,
    MaintenanceUnavailable,
    InvalidPhase,
    Protocol,
}

/// Client-facing error.
#[derive(Debug, Error)]
pub enum TrellisError {
    /// Validation of a tier manager failed.
    #[error("unable to validate tier manager '{namespace}'")]
    Validation {
        namespace: String,
        #[source]
        source: LifecycleError,
    },

    /// Creation of a tier manager failed.
    #[error("unable to create tier manager '{namespace}'")]
    Creation {
        namespace: String,
        #[source]
        source: LifecycleError,
    },

    /// Destruction of a tier manager failed.
    #[error("unable to destroy tier manager '{namespace}'")]
    Destruction {
        namespace: String,
        #[source]
        source: LifecycleError,
    },

    /// Any other entity operation was rejected.
    #[error("{operation} on '{entity}' rejected")]
    Rejected {
        operation: &'static str,
        entity: String,
        #[source]
        source: LifecycleError,
    },

    /// The active server became unreachable and the call was not retried.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// No active server appeared within the reconnect window.
    #[error("no active server available after {waited_ms}ms")]
    NoActiveServer { waited_ms: u64 },

    /// Another client holds the maintenance lease.
    #[error("maintenance lease for '{namespace}' is held by another client")]
    MaintenanceLeaseUnavailable { namespace: String },

    /// The namespace is under maintenance; normal start is refused.
    #[error("tier manager '{namespace}' is under maintenance")]
    MaintenanceInProgress { namespace: String },

    /// The server answered with a response that does not fit the request.
    #[error("unexpected response to {operation}: {response}")]
    UnexpectedResponse { operation: String, response: String },

    /// Lifecycle call made in the wrong phase.
    #[error("cannot {operation} while {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: String,
    },
}

impl TrellisError {
    /// Create a ConnectionLost error.
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { source, .. }
            | Self::Creation { source, .. }
            | Self::Destruction { source, .. }
            | Self::Rejected { source, .. } => source.kind(),
            Self::ConnectionLost { .. } | Self::NoActiveServer { .. } => ErrorKind::ConnectionLost,
            Self::MaintenanceLeaseUnavailable { .. } | Self::MaintenanceInProgress { .. } => {
                ErrorKind::MaintenanceUnavailable
            }
            Self::InvalidPhase { .. } => ErrorKind::InvalidPhase,
            Self::UnexpectedResponse { .. } => ErrorKind::Protocol,
        }
    }

    /// The entity-level cause, if this error wraps one.
    pub fn lifecycle_cause(&self) -> Option<&LifecycleError> {
        match self {
            Self::Validation { source, .. }
            | Self::Creation { source, .. }
            | Self::Destruction { source, .. }
            | Self::Rejected { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Check if re-resolving the active and retrying may succeed.
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::ConnectionLost
    }
}

/// Result type using TrellisError.
pub type TrellisResult<T> = Result<T, TrellisError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn validation_error_keeps_duplicate_tracking_cause() {
        let client = ClientIdentity::generate();
        let err = TrellisError::Validation {
            namespace: "cm".to_string(),
            source: LifecycleError::DuplicateTracking {
                client,
                connection: ConnectionId(7),
            },
        };

        assert_eq!(err.kind(), ErrorKind::DuplicateTracking);
        assert!(!err.is_retriable());
        let cause = err.source().expect("cause").to_string();
        assert!(cause.contains("is already being tracked with Client Id"));
        assert!(cause.contains(&client.to_string()));
    }

    #[test]
    fn not_active_counts_as_connection_loss() {
        let err = LifecycleError::NotActive {
            server: ServerId(2),
        };
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert!(TrellisError::connection_lost("gone").is_retriable());
    }

    #[test]
    fn unexpected_response_is_not_retried() {
        let err = TrellisError::UnexpectedResponse {
            operation: "unlock".to_string(),
            response: "Done".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_retriable());
        assert!(err.lifecycle_cause().is_none());
    }
}
