//! Job scheduling for herald
//!
//! Runs cancellable background operations (reconnection attempts and the like)
//! on tokio and keeps a record of how each of them ended.

pub mod job;
pub mod runner;

pub use job::{JobRecord, JobStatus};
pub use runner::{JobRunner, JobRunnerConfig};
