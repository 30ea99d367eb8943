//! Client side of the read/write lock entity.
//!
//! Acquisition never blocks: a lock that cannot be taken yields `None`.
//! A successful acquisition yields a [`Hold`], which is consumed by
//! [`Hold::unlock`], so a hold cannot be released twice. Holds are
//! replicated like any other entity state and stay valid when a standby is
//! promoted.

use super::entity::unexpected;
use crate::cluster::Connection;
use crate::core::error::{TrellisError, TrellisResult};
use crate::core::identity::HoldToken;
use crate::entity::lock::LockMode;
use crate::entity::{EntityRequest, EntityResponse, LockOutcome};
use std::sync::Arc;

/// Handle on a named lock.
#[derive(Debug, Clone)]
pub struct ReadWriteLock {
    connection: Arc<Connection>,
    name: String,
}

impl ReadWriteLock {
    /// Address the lock called `name` over `connection`.
    pub fn new(connection: Arc<Connection>, name: impl Into<String>) -> Self {
        Self {
            connection,
            name: name.into(),
        }
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take a shared hold.
    pub async fn try_read_lock(&self) -> TrellisResult<Option<Hold>> {
        self.try_lock(LockMode::Read).await
    }

    /// Try to take the exclusive hold.
    pub async fn try_write_lock(&self) -> TrellisResult<Option<Hold>> {
        self.try_lock(LockMode::Write).await
    }

    async fn try_lock(&self, mode: LockMode) -> TrellisResult<Option<Hold>> {
        let token = self.connection.mint_hold_token();
        let request = EntityRequest::TryLock {
            name: self.name.clone(),
            mode,
            token,
        };
        let response = self
            .connection
            .call(request)
            .await?
            .map_err(|source| TrellisError::Rejected {
                operation: "try-lock",
                entity: self.name.clone(),
                source,
            })?;

        match response {
            EntityResponse::Lock(LockOutcome::Granted) => {
                tracing::debug!(lock = %self.name, mode = %mode, token = %token, "hold granted");
                Ok(Some(Hold {
                    connection: self.connection.clone(),
                    name: self.name.clone(),
                    mode,
                    token,
                }))
            }
            EntityResponse::Lock(LockOutcome::Denied) => Ok(None),
            other => Err(unexpected("try-lock", &other)),
        }
    }
}

/// A granted lock hold.
#[derive(Debug)]
#[must_use = "a hold keeps the lock until unlocked"]
pub struct Hold {
    connection: Arc<Connection>,
    name: String,
    mode: LockMode,
    token: HoldToken,
}

impl Hold {
    /// Mode of the hold.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Token identifying the hold on the server.
    pub fn token(&self) -> HoldToken {
        self.token
    }

    /// Name of the held lock.
    pub fn lock_name(&self) -> &str {
        &self.name
    }

    /// Release the hold on whichever server is active now.
    ///
    /// A hold the server no longer knows (released by a retried unlock that
    /// already took effect before a failover) counts as released.
    pub async fn unlock(self) -> TrellisResult<()> {
        let request = EntityRequest::Unlock {
            name: self.name.clone(),
            token: self.token,
        };
        let response = self
            .connection
            .call(request)
            .await?
            .map_err(|source| TrellisError::Rejected {
                operation: "unlock",
                entity: self.name.clone(),
                source,
            })?;

        match response {
            EntityResponse::Released(released) => {
                tracing::debug!(lock = %self.name, token = %self.token, released, "hold released");
                Ok(())
            }
            other => Err(unexpected("unlock", &other)),
        }
    }
}
