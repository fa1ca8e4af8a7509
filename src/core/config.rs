//! # Configuration Module
//!
//! Configuration surface for the pipeline: per-cache capacity and TTL, pool
//! sizing and acquire timeout, dedup retention, retry budget and backoff
//! base, and task-queue capacity. Everything is serde-derived so the whole
//! tree loads from a single YAML file, and every knob has a conservative
//! default so the pipeline can also be constructed entirely from
//! `PipelineConfig::default()` in tests.
//!
//! Durations are written in human-readable form in config files
//! (`"300s"`, `"5m"`) via `humantime_serde`.

use crate::core::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for the intake pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-domain response cache instances
    pub caches: CachesConfig,

    /// Downstream connection pool
    pub pool: PoolConfig,

    /// Event deduplication store
    pub dedup: DedupConfig,

    /// Retry budget and backoff shape for external calls
    pub retry: RetryConfig,

    /// Background task runner
    pub tasks: TasksConfig,

    /// Cache monitor sweep cadence
    pub monitor: MonitorConfig,
}

/// The three independently configured cache instances
///
/// Instances are logically independent: distinct key namespaces, distinct
/// capacity bounds, distinct TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachesConfig {
    /// Text-analysis results, keyed by normalized message content.
    /// Short TTL: answers go stale as the user's data changes.
    pub nlp: CacheInstanceConfig,

    /// Image-analysis results, keyed by content hash.
    /// Longer TTL: identical images recur and their analysis does not drift.
    pub image: CacheInstanceConfig,

    /// Per-user session data, keyed by user id.
    /// TTL tied to session semantics.
    pub session: CacheInstanceConfig,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            nlp: CacheInstanceConfig {
                max_entries: 500,
                ttl: Duration::from_secs(300),
                hot_key_threshold: 5,
            },
            image: CacheInstanceConfig {
                max_entries: 200,
                ttl: Duration::from_secs(1800),
                hot_key_threshold: 5,
            },
            session: CacheInstanceConfig {
                max_entries: 1000,
                ttl: Duration::from_secs(300),
                hot_key_threshold: 10,
            },
        }
    }
}

/// Configuration for one cache instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheInstanceConfig {
    /// Maximum number of live entries before LRU eviction kicks in
    pub max_entries: usize,

    /// Default time-to-live for entries stored without an explicit TTL
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Access count past which a key is reported as hot in stats
    pub hot_key_threshold: u64,
}

impl Default for CacheInstanceConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            ttl: Duration::from_secs(300),
            hot_key_threshold: 5,
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly at startup
    pub min_size: usize,

    /// Hard upper bound on live connections
    pub max_size: usize,

    /// How long an acquire may wait for a free connection before failing
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Idle time past which a connection is revalidated before handout
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Deduplication store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// How long a fingerprint stays on record. Must exceed the platform's
    /// maximum redelivery delay; that delay is undocumented upstream, so the
    /// default errs long.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Upper bound on records held between sweeps
    pub max_entries: usize,

    /// When the store cannot record a new fingerprint, `true` accepts the
    /// event with a warning (double processing is bounded and recoverable
    /// here); `false` rejects it.
    pub fail_open: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(600),
            max_entries: 10_000,
            fail_open: true,
        }
    }
}

/// Retry budget and backoff shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Cap applied after exponential growth
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Add up to 50% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Background task runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Bounded queue capacity; submissions past this point hit `overflow`
    pub queue_capacity: usize,

    /// Number of worker tasks draining the queue
    pub workers: usize,

    /// Attempts per task before its failure is recorded and dropped
    pub max_attempts: u32,

    /// Delay before the first in-task retry; doubles per attempt
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,

    /// What to do with a submission when the queue is full
    pub overflow: OverflowPolicy,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            workers: 3,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Behavior of `submit` against a full queue. Either way the caller is never
/// blocked beyond a bounded check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new submission
    Reject,
    /// Evict the oldest pending task to make room
    DropOldest,
}

/// Cache monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between background sweeps of caches and the dedup store
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file and validate it
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent knob combinations early, at startup, instead of
    /// letting them surface as runtime misbehavior.
    pub fn validate(&self) -> PipelineResult<()> {
        for (name, cache) in [
            ("nlp", &self.caches.nlp),
            ("image", &self.caches.image),
            ("session", &self.caches.session),
        ] {
            if cache.max_entries == 0 {
                return Err(PipelineError::config(format!(
                    "cache '{}': max_entries must be greater than zero",
                    name
                )));
            }
            if cache.ttl.is_zero() {
                return Err(PipelineError::config(format!(
                    "cache '{}': ttl must be greater than zero",
                    name
                )));
            }
        }

        if self.pool.max_size == 0 {
            return Err(PipelineError::config("pool: max_size must be greater than zero"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(PipelineError::config(format!(
                "pool: min_size ({}) exceeds max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.pool.acquire_timeout.is_zero() {
            return Err(PipelineError::config("pool: acquire_timeout must be greater than zero"));
        }

        if self.dedup.retention.is_zero() {
            return Err(PipelineError::config("dedup: retention must be greater than zero"));
        }
        if self.dedup.max_entries == 0 {
            return Err(PipelineError::config("dedup: max_entries must be greater than zero"));
        }

        if self.retry.max_attempts == 0 {
            return Err(PipelineError::config("retry: max_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(PipelineError::config("retry: multiplier must be at least 1.0"));
        }

        if self.tasks.queue_capacity == 0 {
            return Err(PipelineError::config("tasks: queue_capacity must be greater than zero"));
        }
        if self.tasks.workers == 0 {
            return Err(PipelineError::config("tasks: workers must be at least 1"));
        }

        Ok(())
    }
}
