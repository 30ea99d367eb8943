//! Identifiers shared by clients and servers.
//!
//! - [`ClientIdentity`] names one logical client (a clustering service or a
//!   lock handle) and survives reconnects.
//! - [`ConnectionId`] names one physical session; a reconnect always yields a
//!   fresh one.
//! - [`HoldToken`] is minted by the client for every lock acquisition attempt.
//! - [`ClusterUri`] addresses a cluster and, once resolved, a namespace.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier for one logical client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity(Uuid);

impl ClientIdentity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (used when a client reattaches with a known id).
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one client session, issued by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of one server process in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

/// Capability token for one lock acquisition.
///
/// The owner is the client identity that requested the hold; the serial is
/// unique per owner. Retried acquisitions reuse the same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldToken {
    /// Client that owns the hold.
    pub owner: ClientIdentity,
    /// Per-owner serial number.
    pub serial: u64,
}

impl HoldToken {
    /// Create a hold token.
    pub fn new(owner: ClientIdentity, serial: u64) -> Self {
        Self { owner, serial }
    }
}

impl fmt::Display for HoldToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.serial)
    }
}

/// Address of a cluster, optionally narrowed to one tier-manager namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterUri {
    cluster: String,
    namespace: Option<String>,
}

impl ClusterUri {
    /// Address a cluster by name.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: None,
        }
    }

    /// Resolve a namespace path against this cluster.
    ///
    /// Leading and trailing slashes are ignored, so `"/destroy-CM"` and
    /// `"destroy-CM"` address the same namespace.
    pub fn resolve(&self, path: &str) -> Self {
        let namespace = path.trim_matches('/');
        Self {
            cluster: self.cluster.clone(),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
        }
    }

    /// Cluster name.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Namespace, if this address names one.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for ClusterUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "trellis://{}/{}", self.cluster, ns),
            None => write!(f, "trellis://{}", self.cluster),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_strips_slashes() {
        let uri = ClusterUri::new("primary");
        assert_eq!(uri.namespace(), None);

        let resolved = uri.resolve("/destroy-CM");
        assert_eq!(resolved.cluster(), "primary");
        assert_eq!(resolved.namespace(), Some("destroy-CM"));
        assert_eq!(resolved, uri.resolve("destroy-CM/"));
        assert_eq!(resolved.to_string(), "trellis://primary/destroy-CM");
    }

    #[test]
    fn resolve_empty_path_has_no_namespace() {
        let uri = ClusterUri::new("primary").resolve("/");
        assert_eq!(uri.namespace(), None);
    }

    #[test]
    fn identities_are_unique() {
        assert_ne!(ClientIdentity::generate(), ClientIdentity::generate());
    }
}
