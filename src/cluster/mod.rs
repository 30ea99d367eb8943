//! Cluster plumbing: client connections and cluster control.

pub mod connection;
pub mod control;

pub use connection::{ClusterDirectory, Connection, ConnectionSettings, Endpoint, RetryPolicy};
pub use control::{ClusterControl, ClusterSettings, InProcessCluster};
