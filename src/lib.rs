//! Trellis - replicated coordination core for a clustered caching tier.
//!
//! Clients attach to a cluster-resident tier manager (one per namespace) and
//! to named read/write locks. One server is active; every mutation it accepts
//! is applied on all standbys before the client is answered, so when the
//! active dies a promoted standby carries the same tracked clients,
//! configurations and lock holds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Client API                               │
//! │  ClusteringService │ ClusterTierManagerClient │ ReadWriteLock   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Connection Layer                           │
//! │        active directory │ timeouts │ reconnect and retry        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Active Server Node                           │
//! │   tier manager entities │ lock entities │ replication log       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ synchronous replication
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Standby Server Nodes                         │
//! │         mirrored state │ passive sync │ promotion               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Cluster bootstrap and shutdown
//! - [`core::identity`] - Identifiers and cluster URIs
//! - [`core::error`] - Error types
//!
//! ## Entities
//! - [`entity::tier_manager`] - Client tracking, configuration, lifecycle
//! - [`entity::lock`] - Read/write lock state machine
//! - [`entity::configuration`] - Server resources and pool configuration
//!
//! ## Replication
//! - [`replication::log`] - Numbered entries, gap detection
//! - [`replication::state`] - Replicated state machine
//! - [`replication::snapshot`] - Passive sync
//!
//! ## Servers and cluster
//! - [`server::node`] - Server process (active or standby)
//! - [`cluster::connection`] - Client connections and active resolution
//! - [`cluster::control`] - Fault injection and promotion
//!
//! ## Client
//! - [`client::service`] - Clustering service lifecycle
//! - [`client::entity`] - Tier manager proxy
//! - [`client::lock`] - Lock handles and holds
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - A client identity is tracked by at most one session per namespace.
//! - Destroy fails while another tracked client references the namespace.
//! - Replication entries are numbered per entity and applied without gaps.
//! - No response is sent before every standby applied its entries.

// Core infrastructure
pub mod core;

// Server-resident entities
pub mod entity;

// Active/standby replication
pub mod replication;

// Server processes
pub mod server;

// Connections and cluster control
pub mod cluster;

// Client API
pub mod client;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, identity, runtime};
pub use client::{ClusteringService, ClusteringServiceConfiguration, Hold, ReadWriteLock};
pub use cluster::{ClusterControl, InProcessCluster};
