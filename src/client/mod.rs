//! Client-side API.
//!
//! - [`service`] - lifecycle of one cache manager's view of a tier manager
//! - [`entity`] - tier manager proxy
//! - [`lock`] - read/write lock handles

pub mod entity;
pub mod lock;
pub mod service;

pub use entity::ClusterTierManagerClient;
pub use lock::{Hold, ReadWriteLock};
pub use service::{ClusteringService, ClusteringServiceConfiguration, ServicePhase};
