//! # External Processor Interface
//!
//! The pipeline treats NLP, image analysis, and plain chat handling as black
//! boxes behind one polymorphic interface, so the coordinator's logic never
//! depends on which concrete processor a payload lands on. Implementations
//! live outside this crate; they are handed the pooled connection the
//! coordinator scoped around the processing call for whatever persistent
//! reads and writes they need.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{EventPayload, InboundEvent, ProcessorOutput};

/// Which content kind a processor handles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    /// Text understanding and answer generation
    Nlp,
    /// Image content analysis
    Image,
    /// Session events and anything conversational that needs no analysis
    Chat,
}

impl ProcessorKind {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nlp => "nlp",
            Self::Image => "image",
            Self::Chat => "chat",
        }
    }
}

/// A single external processor
///
/// `C` is the pooled connection type supplied by the coordinator. The
/// processor may issue arbitrary reads and writes through it; the pipeline
/// does not interpret the schema. `process` must be idempotent — the
/// coordinator retries transient failures.
#[async_trait]
pub trait Processor<C: Send>: Send + Sync {
    /// The content kind this processor handles
    fn kind(&self) -> ProcessorKind;

    /// Process one event and produce the formatted result
    async fn process(&self, event: &InboundEvent, conn: &mut C) -> PipelineResult<ProcessorOutput>;
}

/// The coordinator's dispatch table: one processor per content kind
pub struct ProcessorSet<C: Send> {
    nlp: Arc<dyn Processor<C>>,
    image: Arc<dyn Processor<C>>,
    chat: Arc<dyn Processor<C>>,
}

impl<C: Send> ProcessorSet<C> {
    /// Assemble the dispatch table
    pub fn new(
        nlp: Arc<dyn Processor<C>>,
        image: Arc<dyn Processor<C>>,
        chat: Arc<dyn Processor<C>>,
    ) -> Self {
        Self { nlp, image, chat }
    }

    /// Pick the processor for an event's payload
    ///
    /// Unknown payload kinds are invalid input: never processed, answered
    /// with a fallback.
    pub fn for_event(&self, event: &InboundEvent) -> PipelineResult<&Arc<dyn Processor<C>>> {
        match &event.payload {
            EventPayload::Text { .. } => Ok(&self.nlp),
            EventPayload::Image { .. } => Ok(&self.image),
            EventPayload::Follow { .. } => Ok(&self.chat),
            EventPayload::Unknown { kind } => Err(PipelineError::invalid_event(format!(
                "unsupported event kind '{}'",
                kind
            ))),
        }
    }
}
