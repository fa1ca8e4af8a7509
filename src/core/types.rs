//! # Core Types Module
//!
//! Data structures shared across the pipeline: the inbound event delivered by
//! the messaging platform, processor output, and the reply sent back out.
//! The platform may deliver the same event more than once; nothing in these
//! types assumes single delivery — that guarantee is produced downstream by
//! the deduplication store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event as delivered by the upstream messaging platform
///
/// `event_id`, `timestamp` and `channel` together identify a logical event
/// across redeliveries and feed the deduplication fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform-assigned delivery identifier
    pub event_id: String,

    /// Platform timestamp (Unix milliseconds)
    pub timestamp: u64,

    /// Source channel (room, group, or direct-message identifier)
    pub channel: String,

    /// The event content
    pub payload: EventPayload,
}

/// Content variants the pipeline knows how to route
///
/// Anything else arrives as `Unknown` and is answered with a fallback rather
/// than dropped silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A text message from a user
    Text { user_id: String, text: String },

    /// An image upload; `content` carries the raw bytes
    Image { user_id: String, content: Vec<u8> },

    /// A user or channel started a session (joined, followed, subscribed)
    Follow { user_id: String },

    /// Any event type the pipeline does not handle
    Unknown { kind: String },
}

impl InboundEvent {
    /// Create a new event
    pub fn new<S: Into<String>>(event_id: S, timestamp: u64, channel: S, payload: EventPayload) -> Self {
        Self {
            event_id: event_id.into(),
            timestamp,
            channel: channel.into(),
            payload,
        }
    }

    /// The user behind this event, when the payload carries one
    pub fn user_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Text { user_id, .. } => Some(user_id),
            EventPayload::Image { user_id, .. } => Some(user_id),
            EventPayload::Follow { user_id } => Some(user_id),
            EventPayload::Unknown { .. } => None,
        }
    }

    /// Short label for logs and metrics
    pub fn kind_label(&self) -> &'static str {
        match &self.payload {
            EventPayload::Text { .. } => "text",
            EventPayload::Image { .. } => "image",
            EventPayload::Follow { .. } => "follow",
            EventPayload::Unknown { .. } => "unknown",
        }
    }
}

/// Result produced by an external processor on a cache miss
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorOutput {
    /// The formatted answer text
    pub text: String,

    /// Structured attributes extracted alongside the answer
    /// (intent labels, nutrition figures, confidence scores)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl ProcessorOutput {
    /// Create an output carrying only answer text
    pub fn text_only<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            attributes: HashMap::new(),
        }
    }
}

/// Where a reply came from, for logs, metrics, and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    /// Served from a response cache
    Cache,
    /// Served from a cache entry past its TTL while downstream was failing
    StaleCache,
    /// Computed by an external processor this request
    Processor,
    /// Generic fallback after an unrecoverable failure
    Fallback,
    /// No-op acknowledgement for a redelivered event
    Duplicate,
}

/// The unified result handed to the reply channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// The event this reply answers
    pub event_id: String,

    /// Outbound message text; empty for duplicate acknowledgements
    pub text: String,

    /// Provenance of the answer
    pub source: ReplySource,
}

impl Reply {
    /// Build a reply for an event
    pub fn new<S: Into<String>>(event_id: S, text: S, source: ReplySource) -> Self {
        Self {
            event_id: event_id.into(),
            text: text.into(),
            source,
        }
    }

    /// Empty acknowledgement for a duplicate delivery
    pub fn duplicate_ack<S: Into<String>>(event_id: S) -> Self {
        Self {
            event_id: event_id.into(),
            text: String::new(),
            source: ReplySource::Duplicate,
        }
    }
}
