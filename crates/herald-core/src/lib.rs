//! herald-core - Shared vocabulary of the herald chat bridge
//!
//! This crate provides:
//! - The channel addressing and inbound message model shared by every chat provider
//! - The categorized error type surfaced by providers
//! - Bot and channel configuration records
//! - The job subsystem and delay abstractions the reconnection machinery runs on

pub mod config;
pub mod delay;
pub mod error;
pub mod jobs;
pub mod types;

// Re-export main types for convenience
pub use config::{BotConfig, ChannelConfig, ChatProviderKind};
pub use delay::{Delayer, TokioDelayer};
pub use error::{ChatError, Result};
pub use jobs::{Job, JobDescriptor, JobManager, JobOutcome, JobWork};
pub use types::{
    ChannelAddress, ChatUser, DeploymentUpdate, InboundMessage, QueueItem, RevisionInfo, TestMerge,
    UpdateFinalizer,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        // Just verify that all main types are exported
        let _ = std::mem::size_of::<ChannelAddress>();
        let _ = std::mem::size_of::<InboundMessage>();
        let _ = std::mem::size_of::<QueueItem>();
        let _ = std::mem::size_of::<ChatError>();
        let _ = std::mem::size_of::<BotConfig>();
        let _ = std::mem::size_of::<TokioDelayer>();
    }
}
