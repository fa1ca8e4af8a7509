//! # Pipeline Module
//!
//! The coordinator that runs each inbound event through dedup, cache,
//! processing, and reply, plus the boundary traits it talks through and the
//! startup prewarmer. The external collaborators — processors, reply
//! channel, connection factory — are implemented outside this crate.

pub mod coordinator;
pub mod prewarm;
pub mod processor;
pub mod reply;

pub use coordinator::PipelineCoordinator;
pub use prewarm::{PrewarmEntry, Prewarmer};
pub use processor::{Processor, ProcessorKind, ProcessorSet};
pub use reply::{LoggingReplyChannel, MemoryReplyChannel, ReplyChannel};
