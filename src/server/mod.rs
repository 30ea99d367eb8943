//! Server processes hosting the replicated entities.

pub mod message;
pub mod node;
pub mod roster;

pub use message::{NodeStatus, ServerMessage, ServerRole, StandbyLink};
pub use node::{NodeSettings, ServerHandle, ServerNode};
pub use roster::InSyncRoster;
