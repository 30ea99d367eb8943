//! Server-resident entities.
//!
//! - [`tier_manager`] - per-namespace client tracking and configuration
//! - [`lock`] - named read/write locks
//! - [`configuration`] - server resources and tier-manager configuration
//!
//! Requests and responses below are what a client connection carries to the
//! active server.

pub mod configuration;
pub mod lock;
pub mod tier_manager;

use crate::core::identity::{ClientIdentity, HoldToken};
use configuration::{ServerSideConfiguration, TierConfiguration};
use lock::LockMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request addressed to an entity on the active server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRequest {
    /// Validate (and track) against an existing tier manager.
    Validate {
        namespace: String,
        configuration: Option<ServerSideConfiguration>,
    },
    /// Create a tier manager and track the caller.
    Create {
        namespace: String,
        configuration: ServerSideConfiguration,
    },
    /// Destroy a tier manager.
    Destroy { namespace: String },
    /// Stop tracking the caller.
    Untrack { namespace: String },
    /// Add a cache tier to a tier manager.
    ConfigureTier {
        namespace: String,
        tier: String,
        configuration: TierConfiguration,
    },
    /// Read the tier manager state.
    Describe { namespace: String },
    /// Non-blocking lock acquisition.
    TryLock {
        name: String,
        mode: LockMode,
        token: HoldToken,
    },
    /// Release a hold.
    Unlock { name: String, token: HoldToken },
}

impl EntityRequest {
    /// Check whether this request is retried after an ambiguous failure.
    ///
    /// Repeating any request leaves the same state behind, but a repeat can
    /// report a different outcome than the lost original: a repeated create
    /// reports `AlreadyExists`, a repeated destroy `NotFound`. Callers handle
    /// the create case by falling back to validate; destroy is not retried.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Destroy { .. })
    }

    /// Short operation name for diagnostics.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Validate { .. } => "validate",
            Self::Create { .. } => "create",
            Self::Destroy { .. } => "destroy",
            Self::Untrack { .. } => "untrack",
            Self::ConfigureTier { .. } => "configure-tier",
            Self::Describe { .. } => "describe",
            Self::TryLock { .. } => "try-lock",
            Self::Unlock { .. } => "unlock",
        }
    }
}

/// Successful entity response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityResponse {
    /// Operation completed.
    Done,
    /// Tier manager state.
    TierManager(TierManagerView),
    /// Lock acquisition outcome.
    Lock(LockOutcome),
    /// Unlock outcome; `false` when the hold was already gone.
    Released(bool),
}

/// Outcome of a non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOutcome {
    Granted,
    Denied,
}

/// Diagnostic view of a tier manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierManagerView {
    /// Namespace.
    pub namespace: String,
    /// Stored configuration.
    pub configuration: ServerSideConfiguration,
    /// Tracked client identities.
    pub tracked_clients: Vec<ClientIdentity>,
    /// Configured tiers.
    pub tiers: BTreeMap<String, TierConfiguration>,
}
