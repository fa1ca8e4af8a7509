//! # Cache Monitor
//!
//! Background sweeping for the cache instances and the dedup store, plus a
//! human-readable status report for the diagnostic path. Sweeping bounds
//! memory independent of read traffic; lazy expiry alone only reclaims keys
//! that are read again.
//!
//! The monitor runs off the request path and is stopped through a
//! `CancellationToken` at shutdown.

use metrics::gauge;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::caching::dedup::DedupStore;
use crate::caching::registry::CacheRegistry;
use crate::core::config::MonitorConfig;

/// Periodic sweeper over all cache state
pub struct CacheMonitor {
    registry: Arc<CacheRegistry>,
    dedup: Arc<DedupStore>,
    config: MonitorConfig,
    cancel: CancellationToken,
}

impl CacheMonitor {
    /// Create a monitor over the given stores
    pub fn new(registry: Arc<CacheRegistry>, dedup: Arc<DedupStore>, config: MonitorConfig) -> Self {
        Self {
            registry,
            dedup,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the background sweep loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let monitor = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.sweep_interval);
            // The first tick fires immediately; skip it so a fresh pipeline
            // does not sweep an empty cache at startup.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => {
                        info!("cache monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        monitor.sweep_once();
                    }
                }
            }
        })
    }

    /// One sweep pass over caches and the dedup store
    pub fn sweep_once(&self) {
        let cache_removed = self.registry.sweep_all();
        let dedup_removed = self.dedup.sweep();

        for stats in self.registry.stats_all() {
            gauge!("cache_entries", "cache" => stats.name.clone()).set(stats.entries as f64);
        }

        if cache_removed > 0 || dedup_removed > 0 {
            debug!(cache_removed, dedup_removed, "background sweep completed");
        }
    }

    /// Stop the sweep loop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Render a status report for the diagnostic path
    pub fn report(&self) -> String {
        let mut lines = vec!["=== cache status ===".to_string()];

        for stats in self.registry.stats_all() {
            lines.push(format!(
                "{}: {}/{} entries, {} hits, {} misses, {:.1}% hit rate, {} evictions, {} hot keys",
                stats.name,
                stats.entries,
                stats.max_entries,
                stats.hits,
                stats.misses,
                stats.hit_rate,
                stats.evictions,
                stats.hot_keys,
            ));
        }

        let (accepted, duplicates, fail_open) = self.dedup.counters();
        lines.push(format!(
            "dedup: {} records, {} accepted, {} duplicates, {} fail-open accepts",
            self.dedup.len(),
            accepted,
            duplicates,
            fail_open,
        ));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{CachesConfig, DedupConfig};
    use std::time::Duration;

    fn monitor(sweep_interval: Duration) -> Arc<CacheMonitor> {
        let registry = Arc::new(CacheRegistry::new(&CachesConfig::default()));
        let dedup = Arc::new(DedupStore::new(DedupConfig {
            retention: Duration::from_millis(30),
            max_entries: 100,
            fail_open: true,
        }));
        Arc::new(CacheMonitor::new(
            registry,
            dedup,
            MonitorConfig { sweep_interval },
        ))
    }

    #[tokio::test]
    async fn test_sweep_once_clears_expired_state() {
        let monitor = monitor(Duration::from_secs(60));
        monitor
            .registry
            .nlp
            .put("k", b"v".to_vec(), Some(Duration::from_millis(20)));
        monitor.dedup.register("fp-1").unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.sweep_once();

        assert!(monitor.registry.nlp.is_empty());
        assert!(monitor.dedup.is_empty());
    }

    #[tokio::test]
    async fn test_background_loop_sweeps_and_stops() {
        let monitor = monitor(Duration::from_millis(25));
        monitor
            .registry
            .image
            .put("k", b"v".to_vec(), Some(Duration::from_millis(10)));

        let handle = monitor.clone().start();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(monitor.registry.image.is_empty());

        monitor.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor loop should exit after stop")
            .unwrap();
    }

    #[test]
    fn test_report_mentions_every_instance() {
        let monitor = monitor(Duration::from_secs(60));
        let report = monitor.report();
        assert!(report.contains("nlp:"));
        assert!(report.contains("image:"));
        assert!(report.contains("session:"));
        assert!(report.contains("dedup:"));
    }
}
