//! Server resources and tier-manager configuration.
//!
//! Server resources are declared once at cluster bootstrap (named offheap
//! pools with a size). A tier manager stores a [`ServerSideConfiguration`]
//! naming its default server resource and any shared pools carved from those
//! resources; clients validating against an existing tier manager must present
//! a compatible configuration.

use crate::core::error::LifecycleError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Memory unit used by resource and pool declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryUnit {
    B,
    KB,
    MB,
    GB,
}

impl MemoryUnit {
    /// Convert a size in this unit to bytes.
    pub fn to_bytes(&self, size: u64) -> u64 {
        let factor: u64 = match self {
            Self::B => 1,
            Self::KB => 1 << 10,
            Self::MB => 1 << 20,
            Self::GB => 1 << 30,
        };
        size.saturating_mul(factor)
    }
}

impl fmt::Display for MemoryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::B => "B",
            Self::KB => "KB",
            Self::MB => "MB",
            Self::GB => "GB",
        };
        f.write_str(s)
    }
}

/// One offheap resource declared by the server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResource {
    /// Resource name, e.g. `primary-server-resource`.
    pub name: String,
    /// Unit of `size`.
    pub unit: MemoryUnit,
    /// Capacity in `unit`.
    pub size: u64,
}

impl ServerResource {
    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.unit.to_bytes(self.size)
    }
}

/// All server resources of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResources {
    resources: BTreeMap<String, ServerResource>,
}

impl ServerResources {
    /// Build from a list of declarations. Later duplicates replace earlier ones.
    pub fn new(resources: impl IntoIterator<Item = ServerResource>) -> Self {
        Self {
            resources: resources
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
        }
    }

    /// Check whether a resource is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    /// Look up a resource.
    pub fn get(&self, name: &str) -> Option<&ServerResource> {
        self.resources.get(name)
    }

    /// Iterate over declared resource names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Number of declared resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check if no resources are declared.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// A pool carved out of a server resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefinition {
    /// Backing server resource. `None` means the tier manager's default.
    pub server_resource: Option<String>,
    /// Pool size in `unit`.
    pub size: u64,
    /// Unit of `size`.
    pub unit: MemoryUnit,
}

impl PoolDefinition {
    /// Pool on the default server resource.
    pub fn on_default(size: u64, unit: MemoryUnit) -> Self {
        Self {
            server_resource: None,
            size,
            unit,
        }
    }

    /// Pool on a named server resource.
    pub fn on_resource(resource: impl Into<String>, size: u64, unit: MemoryUnit) -> Self {
        Self {
            server_resource: Some(resource.into()),
            size,
            unit,
        }
    }
}

/// Server-side configuration of a tier manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSideConfiguration {
    /// Resource used by pools that do not name one.
    pub default_server_resource: Option<String>,
    /// Shared pools by name.
    pub shared_pools: BTreeMap<String, PoolDefinition>,
}

impl ServerSideConfiguration {
    /// Configuration with only a default server resource.
    pub fn with_default_resource(resource: impl Into<String>) -> Self {
        Self {
            default_server_resource: Some(resource.into()),
            shared_pools: BTreeMap::new(),
        }
    }

    /// Add a shared pool.
    pub fn shared_pool(mut self, name: impl Into<String>, pool: PoolDefinition) -> Self {
        self.shared_pools.insert(name.into(), pool);
        self
    }

    /// Check that every referenced server resource is declared.
    pub fn check_resources(&self, resources: &ServerResources) -> Result<(), LifecycleError> {
        if let Some(default) = &self.default_server_resource {
            if !resources.contains(default) {
                return Err(LifecycleError::InvalidServerResource {
                    reason: format!("default server resource '{}' is not declared", default),
                });
            }
        }
        for (name, pool) in &self.shared_pools {
            self.check_pool(name, pool, resources)?;
        }
        Ok(())
    }

    /// Check a single pool against this configuration and the server resources.
    pub fn check_pool(
        &self,
        name: &str,
        pool: &PoolDefinition,
        resources: &ServerResources,
    ) -> Result<(), LifecycleError> {
        if pool.size == 0 {
            return Err(LifecycleError::InvalidServerResource {
                reason: format!("pool '{}' has zero size", name),
            });
        }
        let resource = pool
            .server_resource
            .as_ref()
            .or(self.default_server_resource.as_ref())
            .ok_or_else(|| LifecycleError::InvalidServerResource {
                reason: format!(
                    "pool '{}' names no server resource and no default is configured",
                    name
                ),
            })?;
        if !resources.contains(resource) {
            return Err(LifecycleError::InvalidServerResource {
                reason: format!("pool '{}' uses undeclared server resource '{}'", name, resource),
            });
        }
        Ok(())
    }

    /// Compare a client-presented configuration against the stored one.
    ///
    /// Returns a human-readable reason on mismatch. A client that names no
    /// default resource and no pools accepts whatever is stored.
    pub fn compatibility_with(&self, stored: &ServerSideConfiguration) -> Result<(), String> {
        if let Some(default) = &self.default_server_resource {
            if stored.default_server_resource.as_ref() != Some(default) {
                return Err(format!(
                    "default resource not aligned: client '{}', server '{}'",
                    default,
                    stored.default_server_resource.as_deref().unwrap_or("<none>")
                ));
            }
        }
        if !self.shared_pools.is_empty() && self.shared_pools != stored.shared_pools {
            let client: Vec<&str> = self.shared_pools.keys().map(String::as_str).collect();
            let server: Vec<&str> = stored.shared_pools.keys().map(String::as_str).collect();
            return Err(format!(
                "shared pools not aligned: client {:?}, server {:?}",
                client, server
            ));
        }
        Ok(())
    }
}

/// How a cache tier obtains its storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolAllocation {
    /// A pool reserved for this tier alone.
    Dedicated(PoolDefinition),
    /// A named shared pool of the tier manager.
    Shared(String),
}

/// Configuration of one named cache tier inside a tier manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfiguration {
    /// Pool allocation for the tier.
    pub allocation: PoolAllocation,
}

impl TierConfiguration {
    /// Tier backed by a dedicated pool.
    pub fn dedicated(pool: PoolDefinition) -> Self {
        Self {
            allocation: PoolAllocation::Dedicated(pool),
        }
    }

    /// Tier backed by a shared pool.
    pub fn shared(pool: impl Into<String>) -> Self {
        Self {
            allocation: PoolAllocation::Shared(pool.into()),
        }
    }

    /// Check this tier against the owning configuration and server resources.
    pub fn check(
        &self,
        tier: &str,
        owner: &ServerSideConfiguration,
        resources: &ServerResources,
    ) -> Result<(), LifecycleError> {
        match &self.allocation {
            PoolAllocation::Dedicated(pool) => owner.check_pool(tier, pool, resources),
            PoolAllocation::Shared(name) if owner.shared_pools.contains_key(name) => Ok(()),
            PoolAllocation::Shared(name) => Err(LifecycleError::InvalidServerResource {
                reason: format!("tier '{}' uses unknown shared pool '{}'", tier, name),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> ServerResources {
        ServerResources::new([ServerResource {
            name: "primary-server-resource".to_string(),
            unit: MemoryUnit::MB,
            size: 16,
        }])
    }

    #[test]
    fn unit_conversion() {
        assert_eq!(MemoryUnit::MB.to_bytes(16), 16 * 1024 * 1024);
        assert_eq!(resources().get("primary-server-resource").unwrap().capacity_bytes(), 16 << 20);
    }

    #[test]
    fn undeclared_default_resource_rejected() {
        let config = ServerSideConfiguration::with_default_resource("missing");
        let err = config.check_resources(&resources()).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidServerResource { .. }));
    }

    #[test]
    fn pool_without_any_resource_rejected() {
        let config = ServerSideConfiguration::default()
            .shared_pool("p", PoolDefinition::on_default(4, MemoryUnit::MB));
        assert!(config.check_resources(&resources()).is_err());

        let config = ServerSideConfiguration::with_default_resource("primary-server-resource")
            .shared_pool("p", PoolDefinition::on_default(4, MemoryUnit::MB));
        assert!(config.check_resources(&resources()).is_ok());
    }

    #[test]
    fn empty_client_config_is_compatible() {
        let stored = ServerSideConfiguration::with_default_resource("primary-server-resource");
        assert!(ServerSideConfiguration::default()
            .compatibility_with(&stored)
            .is_ok());
    }

    #[test]
    fn different_default_resource_is_incompatible() {
        let stored = ServerSideConfiguration::with_default_resource("primary-server-resource");
        let client = ServerSideConfiguration::with_default_resource("secondary");
        let reason = client.compatibility_with(&stored).unwrap_err();
        assert!(reason.contains("default resource not aligned"));
    }

    #[test]
    fn shared_tier_requires_known_pool() {
        let owner = ServerSideConfiguration::with_default_resource("primary-server-resource")
            .shared_pool("shared", PoolDefinition::on_default(2, MemoryUnit::MB));
        assert!(TierConfiguration::shared("shared")
            .check("t", &owner, &resources())
            .is_ok());
        assert!(TierConfiguration::shared("other")
            .check("t", &owner, &resources())
            .is_err());
    }
}
