//! # Startup Prewarming
//!
//! First-request latency comes from cold connections and empty caches, so
//! startup kicks both off ahead of traffic: the pool is filled to its
//! configured minimum and any configured cache keys are preloaded through a
//! caller-supplied loader. Everything runs through the task runner —
//! fire-and-forget, off the intake path — and a prewarm failure is a logged
//! warning, never a startup failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::caching::store::ResponseCache;
use crate::core::connection_pool::{ConnectionFactory, ConnectionPool};
use crate::core::error::PipelineResult;
use crate::tasks::TaskRunner;

/// Async loader producing the bytes for one preloaded key
pub type PrewarmLoader =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = PipelineResult<Vec<u8>>> + Send>> + Send + Sync>;

/// One cache key to load ahead of traffic
pub struct PrewarmEntry {
    pub cache: Arc<ResponseCache>,
    pub key: String,
    pub loader: PrewarmLoader,
}

impl PrewarmEntry {
    /// Build an entry from a plain async closure
    pub fn new<F, Fut>(cache: Arc<ResponseCache>, key: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineResult<Vec<u8>>> + Send + 'static,
    {
        Self {
            cache,
            key: key.into(),
            loader: Arc::new(move || {
                Box::pin(loader()) as Pin<Box<dyn Future<Output = PipelineResult<Vec<u8>>> + Send>>
            }),
        }
    }
}

/// One-shot startup warmer
#[derive(Default)]
pub struct Prewarmer {
    started: AtomicBool,
}

impl Prewarmer {
    /// Create an idle prewarmer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the prewarm work; returns `false` if it already ran
    ///
    /// Idempotent by construction: only the first call queues anything.
    pub fn start<F: ConnectionFactory>(
        &self,
        pool: &Arc<ConnectionPool<F>>,
        tasks: &TaskRunner,
        entries: Vec<PrewarmEntry>,
    ) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(cache_keys = entries.len(), "prewarm started");

        let pool = Arc::clone(pool);
        tasks.submit("prewarm-pool", move || {
            let pool = Arc::clone(&pool);
            async move {
                pool.initialize().await;
                Ok(())
            }
        });

        for entry in entries {
            tasks.submit("prewarm-cache", move || {
                let cache = Arc::clone(&entry.cache);
                let key = entry.key.clone();
                let loader = Arc::clone(&entry.loader);
                async move {
                    if cache.get_stale(&key).is_some() {
                        return Ok(());
                    }
                    let value = loader().await?;
                    cache.put(&key, value, None);
                    Ok(())
                }
            });
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CacheInstanceConfig, PoolConfig, TasksConfig};
    use crate::core::error::PipelineError;
    use async_trait::async_trait;
    use std::time::Duration;

    struct TestFactory;

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        type Conn = ();

        async fn connect(&self) -> PipelineResult<()> {
            Ok(())
        }

        async fn validate(&self, _conn: &mut ()) -> bool {
            true
        }
    }

    fn pool(min: usize) -> Arc<ConnectionPool<TestFactory>> {
        Arc::new(ConnectionPool::new(
            TestFactory,
            PoolConfig {
                min_size: min,
                max_size: 5,
                acquire_timeout: Duration::from_millis(100),
                stale_after: Duration::from_secs(60),
            },
        ))
    }

    fn runner() -> Arc<TaskRunner> {
        TaskRunner::new(TasksConfig::default())
    }

    #[tokio::test]
    async fn test_prewarm_fills_pool_and_caches() {
        let pool = pool(2);
        let tasks = runner();
        let cache = Arc::new(ResponseCache::new("nlp", CacheInstanceConfig::default()));
        let prewarmer = Prewarmer::new();

        let entries = vec![PrewarmEntry::new(cache.clone(), "warm-key", || async {
            Ok(b"warm-value".to_vec())
        })];
        assert!(prewarmer.start(&pool, &tasks, entries));

        tasks.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(cache.get("warm-key"), Some(b"warm-value".to_vec()));
    }

    #[tokio::test]
    async fn test_prewarm_is_idempotent() {
        let pool = pool(1);
        let tasks = runner();
        let prewarmer = Prewarmer::new();

        assert!(prewarmer.start(&pool, &tasks, Vec::new()));
        assert!(!prewarmer.start(&pool, &tasks, Vec::new()));

        tasks.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_loader_failure_is_contained() {
        let pool = pool(0);
        let tasks = runner();
        let cache = Arc::new(ResponseCache::new("nlp", CacheInstanceConfig::default()));
        let prewarmer = Prewarmer::new();

        let entries = vec![PrewarmEntry::new(cache.clone(), "bad-key", || async {
            Err(PipelineError::processor("nlp", "loader down"))
        })];
        prewarmer.start(&pool, &tasks, entries);

        tasks.drain(Duration::from_secs(1)).await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(tasks.stats().failed, 1);
    }
}
