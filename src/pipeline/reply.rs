//! # Reply Channel Interface
//!
//! Outbound edge of the pipeline. Delivery is best-effort: a failure here is
//! logged and never retried against the dedup store — the event is already
//! complete by the time a reply goes out.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::core::error::PipelineResult;
use crate::core::types::Reply;

/// Outbound delivery of formatted results
#[async_trait]
pub trait ReplyChannel: Send + Sync {
    /// Deliver one reply
    async fn send(&self, reply: &Reply) -> PipelineResult<()>;
}

/// Reply channel that writes to the log; used when running without a
/// messaging platform attached
pub struct LoggingReplyChannel;

#[async_trait]
impl ReplyChannel for LoggingReplyChannel {
    async fn send(&self, reply: &Reply) -> PipelineResult<()> {
        info!(
            event_id = %reply.event_id,
            source = ?reply.source,
            text = %reply.text,
            "reply delivered"
        );
        Ok(())
    }
}

/// Reply channel that collects replies in memory, for tests and local runs
#[derive(Default)]
pub struct MemoryReplyChannel {
    replies: Mutex<Vec<Reply>>,
}

impl MemoryReplyChannel {
    /// Create an empty channel
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything delivered so far
    pub fn sent(&self) -> Vec<Reply> {
        self.replies.lock().clone()
    }
}

#[async_trait]
impl ReplyChannel for MemoryReplyChannel {
    async fn send(&self, reply: &Reply) -> PipelineResult<()> {
        self.replies.lock().push(reply.clone());
        Ok(())
    }
}
