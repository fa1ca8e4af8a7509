//! # Response Cache Store
//!
//! One named, independently configured cache instance with LRU eviction,
//! per-entry TTL, and lazy expiry. Instantiated once per semantic domain
//! (NLP results, image analysis, per-user session data) by the registry.
//!
//! All bookkeeping — the entry map, the LRU ordering, and the hot-key set —
//! lives under a single `parking_lot::Mutex`, so concurrent `get`/`put` on
//! the same key can never tear size counters or access order. Instances are
//! independent and never contend with each other.

use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core::config::CacheInstanceConfig;

/// A cached value with lifecycle metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    created_at: Instant,
    expires_at: Instant,
    size_hint: usize,
    access_count: u64,
    /// Monotonic sequence of the last read or write, for LRU ordering
    last_access_tick: u64,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration, tick: u64) -> Self {
        let now = Instant::now();
        let size_hint = value.len();
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            size_hint,
            access_count: 0,
            last_access_tick: tick,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Remaining lifetime as a fraction of the original TTL
    fn remaining_fraction(&self) -> f64 {
        let total = self.expires_at.saturating_duration_since(self.created_at);
        if total.is_zero() {
            return 0.0;
        }
        let left = self.expires_at.saturating_duration_since(Instant::now());
        left.as_secs_f64() / total.as_secs_f64()
    }
}

/// State guarded by the instance's single lock
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys whose access count crossed the hot threshold
    hot_keys: HashSet<String>,
    /// Monotonic access counter driving LRU order
    tick: u64,
}

/// Snapshot of one instance's statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_removals: u64,
    pub hot_keys: usize,
    pub hit_rate: f64,
}

/// A single cache instance
pub struct ResponseCache {
    name: String,
    config: CacheInstanceConfig,
    inner: Mutex<CacheInner>,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_removals: AtomicU64,
}

impl ResponseCache {
    /// Create a named instance from its configuration
    pub fn new<S: Into<String>>(name: S, config: CacheInstanceConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hot_keys: HashSet::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_removals: AtomicU64::new(0),
        }
    }

    /// Instance name, used in stats and log lines
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a live entry
    ///
    /// An entry past its TTL is logically absent: the read returns `None`
    /// and removes it, independent of the background sweep.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let Some(entry) = inner.entries.get_mut(key) else {
            drop(inner);
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("cache_misses", "cache" => self.name.clone()).increment(1);
            return None;
        };

        if entry.is_expired() {
            inner.entries.remove(key);
            inner.hot_keys.remove(key);
            drop(inner);
            self.expired_removals.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("cache_misses", "cache" => self.name.clone()).increment(1);
            return None;
        }

        entry.last_access_tick = tick;
        entry.access_count += 1;
        let value = entry.value.clone();
        let access_count = entry.access_count;
        let near_expiry = entry.remaining_fraction() < 0.2;

        if access_count >= self.config.hot_key_threshold {
            let key_owned = key.to_string();
            let newly_hot = inner.hot_keys.insert(key_owned);
            if near_expiry && !newly_hot {
                // A warmer can pick these up from the logs before the entry lapses.
                debug!(cache = %self.name, key, "hot cache entry nearing expiry");
            }
        }

        drop(inner);
        self.hits.fetch_add(1, Ordering::Relaxed);
        counter!("cache_hits", "cache" => self.name.clone()).increment(1);
        Some(value)
    }

    /// Look up an entry even past its TTL, without touching bookkeeping
    ///
    /// Degraded-mode only: lets the pipeline serve yesterday's answer while
    /// downstream is failing. Returns entries not yet removed by a read or
    /// sweep.
    pub fn get_stale(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace an entry
    ///
    /// `ttl` of `None` uses the instance default. Once the instance is at
    /// capacity, the least-recently-used entry is evicted to make room;
    /// expired residents are reclaimed first.
    pub fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.ttl);
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(key) && inner.entries.len() >= self.config.max_entries {
            self.reclaim_expired_locked(&mut inner);
            while inner.entries.len() >= self.config.max_entries {
                if !self.evict_lru_locked(&mut inner) {
                    break;
                }
            }
        }

        inner
            .entries
            .insert(key.to_string(), CacheEntry::new(value, ttl, tick));
    }

    /// Remove an entry; returns whether one was present
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.hot_keys.remove(key);
        inner.entries.remove(key).is_some()
    }

    /// Remove all expired entries; returns how many were removed
    ///
    /// Bounds memory independent of read traffic; driven by the background
    /// monitor.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        self.reclaim_expired_locked(&mut inner)
    }

    /// Number of resident entries (live and not-yet-swept)
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the instance holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reclaim_expired_locked(&self, inner: &mut CacheInner) -> usize {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.entries.remove(key);
            inner.hot_keys.remove(key);
        }
        let removed = expired.len();
        if removed > 0 {
            self.expired_removals
                .fetch_add(removed as u64, Ordering::Relaxed);
            counter!("cache_expired_removals", "cache" => self.name.clone())
                .increment(removed as u64);
        }
        removed
    }

    fn evict_lru_locked(&self, inner: &mut CacheInner) -> bool {
        let victim = inner
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_access_tick)
            .map(|(k, _)| k.clone());

        match victim {
            Some(key) => {
                debug!(cache = %self.name, key = %key, "evicting least-recently-used entry");
                inner.entries.remove(&key);
                inner.hot_keys.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                counter!("cache_evictions", "cache" => self.name.clone()).increment(1);
                true
            }
            None => false,
        }
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let (entries, hot_keys) = {
            let inner = self.inner.lock();
            (inner.entries.len(), inner.hot_keys.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            name: self.name.clone(),
            entries,
            max_entries: self.config.max_entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_removals: self.expired_removals.load(Ordering::Relaxed),
            hot_keys,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn cache(max_entries: usize, ttl: Duration) -> ResponseCache {
        ResponseCache::new(
            "test",
            CacheInstanceConfig {
                max_entries,
                ttl,
                hot_key_threshold: 3,
            },
        )
    }

    #[test]
    fn test_read_your_write() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("k1", b"v1".to_vec(), None);
        assert_eq!(cache.get("k1"), Some(b"v1".to_vec()));

        // Replacement is visible immediately.
        cache.put("k1", b"v2".to_vec(), None);
        assert_eq!(cache.get("k1"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_miss_on_absent_key() {
        let cache = cache(10, Duration::from_secs(60));
        assert_eq!(cache.get("nope"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_logically_absent() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("short", b"v".to_vec(), Some(Duration::from_millis(30)));

        assert_eq!(cache.get("short"), Some(b"v".to_vec()));
        sleep(Duration::from_millis(60)).await;

        // Lazy expiry: the read reports a miss and removes the entry.
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().expired_removals, 1);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = cache(3, Duration::from_secs(60));
        cache.put("a", b"1".to_vec(), None);
        cache.put("b", b"2".to_vec(), None);
        cache.put("c", b"3".to_vec(), None);

        // Touch "a" so "b" becomes least recently used.
        cache.get("a");

        cache.put("d", b"4".to_vec(), None);
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let cache = cache(100, Duration::from_secs(60));
        for i in 0..101 {
            cache.put(&format!("key_{}", i), vec![i as u8], None);
            assert!(cache.len() <= 100);
        }
        // First-inserted key was the LRU victim; the rest survive.
        assert_eq!(cache.get("key_0"), None);
        for i in 1..101 {
            assert!(cache.get(&format!("key_{}", i)).is_some(), "key_{} lost", i);
        }
    }

    #[tokio::test]
    async fn test_expired_residents_reclaimed_before_live_eviction() {
        let cache = cache(2, Duration::from_secs(60));
        cache.put("old", b"1".to_vec(), Some(Duration::from_millis(20)));
        cache.put("live", b"2".to_vec(), None);
        sleep(Duration::from_millis(50)).await;

        cache.put("new", b"3".to_vec(), None);
        // The expired entry made room; the live one was not evicted.
        assert!(cache.get("live").is_some());
        assert!(cache.get("new").is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("a", b"1".to_vec(), Some(Duration::from_millis(20)));
        cache.put("b", b"2".to_vec(), Some(Duration::from_millis(20)));
        cache.put("c", b"3".to_vec(), None);
        sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.sweep(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_stale_serves_expired_until_swept() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("k", b"old answer".to_vec(), Some(Duration::from_millis(20)));
        sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get_stale("k"), Some(b"old answer".to_vec()));
        cache.sweep();
        assert_eq!(cache.get_stale("k"), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("k", b"v".to_vec(), None);
        assert!(cache.invalidate("k"));
        assert!(!cache.invalidate("k"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_hot_key_tracking() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("popular", b"v".to_vec(), None);
        cache.put("quiet", b"v".to_vec(), None);

        for _ in 0..4 {
            cache.get("popular");
        }
        cache.get("quiet");

        let stats = cache.stats();
        assert_eq!(stats.hot_keys, 1);
        // Tracking is stats-only; semantics are unchanged.
        assert_eq!(cache.get("quiet"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = cache(10, Duration::from_secs(60));
        cache.put("k", b"v".to_vec(), None);
        cache.get("k");
        cache.get("k");
        cache.get("absent");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 66.6).abs() < 1.0);
    }
}
