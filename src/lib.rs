//! # Event Intake Library - Core Library Crate
//!
//! The event intake and response-caching pipeline for a conversational
//! messaging backend. The upstream platform delivers events at least once;
//! this crate makes sure each one is processed at most once, answers from
//! layered caches whenever it can, keeps the scarce downstream connections
//! bounded and reused, pushes non-critical work off the reply path, and
//! classifies every failure through one taxonomy before deciding to retry,
//! degrade, or surface.
//!
//! ## Architecture Overview
//!
//! The crate is built around a handful of core modules:
//! - `core::error`: failure taxonomy and the classification every call site uses
//! - `core::recovery`: exponential-backoff retry driven by that taxonomy
//! - `core::config`: the whole operational-knob surface, loadable from YAML
//! - `core::connection_pool`: bounded pool with RAII release on every exit path
//! - `caching`: per-domain response caches, key derivation, dedup store, monitor
//! - `tasks`: bounded fire-and-forget runner for background work
//! - `pipeline`: the coordinator state machine and its boundary traits
//!
//! External collaborators — the NLP and image processors, the persistent
//! store behind the connection factory, and the outbound reply channel —
//! are consumed through narrow traits and implemented elsewhere.
//!
//! Shared components are explicitly constructed and injected (init at
//! process start, graceful drain at shutdown), never reached through
//! implicit singletons, so every test can build an isolated pipeline.

/// Core functionality: error types, configuration, domain types, retry
/// policy, and the connection pool
pub mod core;

/// Caching system: response caches, key generation, deduplication, monitor
pub mod caching;

/// Background task runner for fire-and-forget work
pub mod tasks;

/// The pipeline coordinator and its boundary traits
pub mod pipeline;

// Re-export commonly used types so callers can write
// `use event_intake::PipelineCoordinator` instead of spelling out the path.

/// Main error type and result alias used throughout the pipeline
pub use crate::core::error::{ErrorKind, PipelineError, PipelineResult};

/// Top-level configuration structure
pub use crate::core::config::PipelineConfig;

/// Domain types crossing the intake boundary
pub use crate::core::types::{EventPayload, InboundEvent, ProcessorOutput, Reply, ReplySource};

/// Connection pooling over a pluggable factory
pub use crate::core::connection_pool::{ConnectionFactory, ConnectionPool, PoolGuard};

/// Retry policy consulted around external calls
pub use crate::core::recovery::RetryPolicy;

/// Cache registry, dedup store, and monitor
pub use crate::caching::{CacheMonitor, CacheRegistry, DedupStore, RegisterOutcome, ResponseCache};

/// Background task runner
pub use crate::tasks::{SubmitOutcome, TaskRunner};

/// The per-event coordinator and its boundary traits
pub use crate::pipeline::{
    PipelineCoordinator, Prewarmer, Processor, ProcessorKind, ProcessorSet, ReplyChannel,
};
