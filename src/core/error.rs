//! # Error Handling Module
//!
//! This module provides the error types used across the intake pipeline and
//! the uniform classification that drives retry, degradation, and fallback
//! decisions. Every call site funnels its failures through
//! [`PipelineError::kind`] before deciding what to do next, so the policy
//! lives in one place instead of being scattered through control flow.

use thiserror::Error;

/// Main result type used throughout the pipeline
///
/// Type alias so call sites can write `PipelineResult<T>` instead of
/// `Result<T, PipelineError>` everywhere.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Comprehensive error types for the intake pipeline
///
/// Each variant represents a different failure condition. The `#[error("...")]`
/// attribute from `thiserror` implements `Display` with the given message.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// Configuration-related errors (invalid knobs, missing files, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The inbound event is malformed or of an unsupported shape
    #[error("Invalid event: {reason}")]
    InvalidEvent { reason: String },

    /// An external call did not finish within its deadline
    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Establishing or using a downstream connection failed
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No pooled connection became available within the acquire timeout
    #[error("Connection pool exhausted: no connection within {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    /// The background task queue refused a submission
    #[error("Task queue full: {capacity} tasks pending")]
    QueueFull { capacity: usize },

    /// A downstream processor (NLP, image analysis) reported a hard failure
    #[error("Processor failure ({processor}): {message}")]
    Processor { processor: String, message: String },

    /// The deduplication or persistent store reported a failure
    #[error("Store error: {message}")]
    Store { message: String },

    /// The reply channel could not deliver an outbound message
    #[error("Reply delivery failed: {message}")]
    ReplyDelivery { message: String },

    /// I/O errors (file operations, network errors, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Invariant violations and other unexpected internal failures
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Failure taxonomy consumed by retry and fallback decisions
///
/// Kinds, not types: many error variants collapse into the same kind, and the
/// kind alone decides whether a call is retried, degraded, or surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network blip or timeout; retry with backoff
    Transient,
    /// Pool or queue saturation; retry once after a brief delay, else degrade
    ResourceExhausted,
    /// Malformed event or data; never retried, surfaced as a user-visible fallback
    InvalidInput,
    /// Downstream service reported a hard failure; no retry within this request
    ExternalService,
    /// Programming or invariant violation; abort this event's pipeline and alert
    Fatal,
}

impl ErrorKind {
    /// String label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ResourceExhausted => "resource_exhausted",
            Self::InvalidInput => "invalid_input",
            Self::ExternalService => "external_service",
            Self::Fatal => "fatal",
        }
    }
}

impl PipelineError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid-event error with a custom reason
    pub fn invalid_event<S: Into<String>>(reason: S) -> Self {
        Self::InvalidEvent {
            reason: reason.into(),
        }
    }

    /// Create a connection error with a custom message
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a processor error for a named processor
    pub fn processor<S: Into<String>>(processor: S, message: S) -> Self {
        Self::Processor {
            processor: processor.into(),
            message: message.into(),
        }
    }

    /// Create a store error with a custom message
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a reply-delivery error with a custom message
    pub fn reply_delivery<S: Into<String>>(message: S) -> Self {
        Self::ReplyDelivery {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error into the retry/fallback taxonomy
    ///
    /// Total mapping: every variant lands in exactly one kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::Connection { .. } => ErrorKind::Transient,
            Self::Io { .. } => ErrorKind::Transient,
            Self::ReplyDelivery { .. } => ErrorKind::Transient,
            Self::PoolExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::QueueFull { .. } => ErrorKind::ResourceExhausted,
            Self::InvalidEvent { .. } => ErrorKind::InvalidInput,
            Self::Json { .. } => ErrorKind::InvalidInput,
            Self::Processor { .. } => ErrorKind::ExternalService,
            Self::Store { .. } => ErrorKind::ExternalService,
            Self::Configuration { .. } => ErrorKind::Fatal,
            Self::Yaml { .. } => ErrorKind::Fatal,
            Self::Internal { .. } => ErrorKind::Fatal,
        }
    }

    /// Check if this error may be retried at all
    ///
    /// Transient failures retry with backoff; resource exhaustion gets a
    /// single delayed retry. Everything else is final for this request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::ResourceExhausted
        )
    }

    /// The generic, non-technical message sent over the reply channel when
    /// this error ends a pipeline. Technical detail stays on the log path.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InvalidInput => {
                "Sorry, I couldn't understand that message. Please try rephrasing it."
            }
            ErrorKind::ResourceExhausted => {
                "The service is busy right now. Please try again in a moment."
            }
            ErrorKind::Transient | ErrorKind::ExternalService | ErrorKind::Fatal => {
                "Something went wrong while handling your request. Please try again later."
            }
        }
    }
}

/// Implement conversion from std::io::Error
impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_json::Error
impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

/// Implement conversion from serde_yaml::Error
impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}
