//! CLI command implementations.

mod config;
mod drill;
mod start;

pub use config::{run_config, ConfigArgs};
pub use drill::{drill, run_drill, service_configuration, DrillArgs, DrillReport};
pub use start::{load_config, run_start, StartArgs};
