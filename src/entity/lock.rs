//! Read/write lock entity.
//!
//! Per lock name:
//!
//! ```text
//! Unlocked    --try_read-->  ReadHeld(1)
//! ReadHeld(n) --try_read-->  ReadHeld(n+1)
//! ReadHeld(1) --unlock---->  Unlocked
//! Unlocked    --try_write->  WriteHeld
//! WriteHeld   --unlock---->  Unlocked
//! ```
//!
//! Any other attempt is denied without changing state. Holders are identified
//! by [`HoldToken`]s, which makes acquisition retries idempotent: a token that
//! already holds the lock in the requested mode is granted again without a new
//! replicated operation. Releasing a token that holds nothing is a no-op.
//!
//! A name with no entry is `Unlocked`. The entry of a lock is removed when its
//! last hold is released, so the registry only holds locks that are held.

use crate::core::identity::{ClientIdentity, HoldToken};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Requested access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// State of one lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    Unlocked,
    /// Held by one or more readers.
    ReadHeld(BTreeSet<HoldToken>),
    /// Held by a single writer.
    WriteHeld(HoldToken),
}

impl LockState {
    /// Mode in which `token` holds this lock, if any.
    pub fn held_by(&self, token: &HoldToken) -> Option<LockMode> {
        match self {
            Self::Unlocked => None,
            Self::ReadHeld(readers) => readers.contains(token).then_some(LockMode::Read),
            Self::WriteHeld(writer) => (writer == token).then_some(LockMode::Write),
        }
    }

    /// Number of current holders.
    pub fn holder_count(&self) -> usize {
        match self {
            Self::Unlocked => 0,
            Self::ReadHeld(readers) => readers.len(),
            Self::WriteHeld(_) => 1,
        }
    }

    /// Check if the lock is free.
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked)
    }

    fn holders(&self) -> Vec<HoldToken> {
        match self {
            Self::Unlocked => Vec::new(),
            Self::ReadHeld(readers) => readers.iter().copied().collect(),
            Self::WriteHeld(writer) => vec![*writer],
        }
    }
}

/// Replicated lock mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOp {
    /// Grant a hold.
    Acquire {
        name: String,
        mode: LockMode,
        token: HoldToken,
    },
    /// Release a hold.
    Release { name: String, token: HoldToken },
}

impl LockOp {
    /// Lock this operation targets.
    pub fn lock_name(&self) -> &str {
        match self {
            Self::Acquire { name, .. } | Self::Release { name, .. } => name,
        }
    }
}

/// Outcome of planning an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// Granted; the operation to replicate, or `None` for a repeated grant.
    Granted(Option<LockOp>),
    /// Not available in the requested mode.
    Denied,
}

/// All locks hosted by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRegistry {
    locks: BTreeMap<String, LockState>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a lock.
    pub fn state(&self, name: &str) -> LockState {
        self.locks.get(name).cloned().unwrap_or_default()
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Check if no lock is held.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Plan a non-blocking acquisition.
    pub fn plan_try_lock(&self, name: &str, mode: LockMode, token: HoldToken) -> LockDecision {
        let state = self.locks.get(name);
        if let Some(held) = state.and_then(|s| s.held_by(&token)) {
            return if held == mode {
                LockDecision::Granted(None)
            } else {
                LockDecision::Denied
            };
        }

        let available = match (state.unwrap_or(&LockState::Unlocked), mode) {
            (LockState::Unlocked, _) => true,
            (LockState::ReadHeld(_), LockMode::Read) => true,
            (LockState::ReadHeld(_), LockMode::Write) | (LockState::WriteHeld(_), _) => false,
        };

        if available {
            LockDecision::Granted(Some(LockOp::Acquire {
                name: name.to_string(),
                mode,
                token,
            }))
        } else {
            LockDecision::Denied
        }
    }

    /// Plan a release. Returns `None` if `token` holds nothing.
    pub fn plan_release(&self, name: &str, token: HoldToken) -> Option<LockOp> {
        self.locks
            .get(name)
            .and_then(|s| s.held_by(&token))
            .map(|_| LockOp::Release {
                name: name.to_string(),
                token,
            })
    }

    /// Plan the release of every hold owned by `owner`.
    pub fn plan_release_owner(&self, owner: ClientIdentity) -> Vec<LockOp> {
        self.locks
            .iter()
            .flat_map(|(name, state)| {
                state
                    .holders()
                    .into_iter()
                    .filter(move |token| token.owner == owner)
                    .map(move |token| LockOp::Release {
                        name: name.clone(),
                        token,
                    })
            })
            .collect()
    }

    /// Apply a planned operation.
    pub fn apply(&mut self, op: &LockOp) -> Result<(), String> {
        match op {
            LockOp::Acquire { name, mode, token } => {
                let state = self.locks.entry(name.clone()).or_default();
                match (mode, state) {
                    (LockMode::Read, LockState::ReadHeld(readers)) => {
                        readers.insert(*token);
                    }
                    (LockMode::Read, state @ LockState::Unlocked) => {
                        *state = LockState::ReadHeld(BTreeSet::from([*token]));
                    }
                    (LockMode::Write, state @ LockState::Unlocked) => {
                        *state = LockState::WriteHeld(*token);
                    }
                    _ => {
                        return Err(format!("lock '{}' cannot grant {} to {}", name, mode, token));
                    }
                }
            }
            LockOp::Release { name, token } => {
                let state = self
                    .locks
                    .get_mut(name)
                    .ok_or_else(|| format!("lock '{}' does not exist", name))?;
                let now_unlocked = match state {
                    LockState::ReadHeld(readers) => {
                        if !readers.remove(token) {
                            return Err(format!("lock '{}' is not held by {}", name, token));
                        }
                        readers.is_empty()
                    }
                    LockState::WriteHeld(writer) if writer == token => true,
                    _ => return Err(format!("lock '{}' is not held by {}", name, token)),
                };
                if now_unlocked {
                    self.locks.remove(name);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(serial: u64) -> HoldToken {
        HoldToken::new(ClientIdentity::generate(), serial)
    }

    fn grant(registry: &mut LockRegistry, name: &str, mode: LockMode, t: HoldToken) -> bool {
        match registry.plan_try_lock(name, mode, t) {
            LockDecision::Granted(Some(op)) => {
                registry.apply(&op).unwrap();
                true
            }
            LockDecision::Granted(None) => true,
            LockDecision::Denied => false,
        }
    }

    #[test]
    fn readers_share_and_exclude_writer() {
        let mut locks = LockRegistry::new();
        let (r1, r2, w) = (token(1), token(2), token(3));

        assert!(grant(&mut locks, "L", LockMode::Read, r1));
        assert!(grant(&mut locks, "L", LockMode::Read, r2));
        assert_eq!(locks.state("L").holder_count(), 2);
        assert!(!grant(&mut locks, "L", LockMode::Write, w));

        locks.apply(&locks.plan_release("L", r1).unwrap()).unwrap();
        assert!(!grant(&mut locks, "L", LockMode::Write, w));
        locks.apply(&locks.plan_release("L", r2).unwrap()).unwrap();
        assert!(locks.state("L").is_unlocked());
        assert!(grant(&mut locks, "L", LockMode::Write, w));
    }

    #[test]
    fn writer_excludes_everyone() {
        let mut locks = LockRegistry::new();
        let w = token(1);
        assert!(grant(&mut locks, "L", LockMode::Write, w));
        assert!(!grant(&mut locks, "L", LockMode::Read, token(2)));
        assert!(!grant(&mut locks, "L", LockMode::Write, token(3)));
    }

    #[test]
    fn repeated_grant_plans_nothing() {
        let mut locks = LockRegistry::new();
        let r = token(1);
        assert!(grant(&mut locks, "L", LockMode::Read, r));
        assert_eq!(locks.plan_try_lock("L", LockMode::Read, r), LockDecision::Granted(None));
        assert_eq!(locks.plan_try_lock("L", LockMode::Write, r), LockDecision::Denied);
    }

    #[test]
    fn release_of_unknown_token_is_noop() {
        let locks = LockRegistry::new();
        assert!(locks.plan_release("L", token(1)).is_none());
    }

    #[test]
    fn release_owner_collects_all_holds() {
        let mut locks = LockRegistry::new();
        let owner = ClientIdentity::generate();
        assert!(grant(&mut locks, "a", LockMode::Read, HoldToken::new(owner, 1)));
        assert!(grant(&mut locks, "b", LockMode::Write, HoldToken::new(owner, 2)));
        assert!(grant(&mut locks, "a", LockMode::Read, token(9)));

        let ops = locks.plan_release_owner(owner);
        assert_eq!(ops.len(), 2);
        for op in &ops {
            locks.apply(op).unwrap();
        }
        assert_eq!(locks.state("a").holder_count(), 1);
        assert!(locks.state("b").is_unlocked());
    }

    #[test]
    fn released_locks_leave_the_registry() {
        let mut locks = LockRegistry::new();
        let (r1, r2, w) = (token(1), token(2), token(3));
        assert!(grant(&mut locks, "readers", LockMode::Read, r1));
        assert!(grant(&mut locks, "readers", LockMode::Read, r2));
        assert!(grant(&mut locks, "writer", LockMode::Write, w));
        assert_eq!(locks.len(), 2);

        locks.apply(&locks.plan_release("readers", r1).unwrap()).unwrap();
        assert_eq!(locks.len(), 2);
        locks.apply(&locks.plan_release("readers", r2).unwrap()).unwrap();
        locks.apply(&locks.plan_release("writer", w).unwrap()).unwrap();
        assert!(locks.is_empty());
        assert!(locks.apply(&LockOp::Release { name: "writer".to_string(), token: w }).is_err());
    }
}
