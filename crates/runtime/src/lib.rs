// Phototask Runtime - service assembly
//
// Decision: This crate is the outermost layer; it is the only one that reads the
// environment and the only one that uses anyhow
// Decision: Everything long-lived is built once in ServiceRuntime and passed by handle

pub mod config;
pub mod error;
pub mod processors;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{ConfigError, Result};
pub use processors::{output_key, register_operations, StorageProcessor, OUTPUT_PREFIX};
pub use runtime::ServiceRuntime;

// Re-export the task surface for embedders
pub use phototask_durable::health::{HealthReport, HealthStatus};
pub use phototask_durable::manager::{
    ManagerError, TaskManager, TaskOutcome, TaskStats, TaskStatusView,
};
