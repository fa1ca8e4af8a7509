//! # Cache Registry
//!
//! Owns the named cache instances, one per semantic domain. Instances are
//! constructed explicitly from configuration and injected where needed —
//! never reached through globals — so every test can build an isolated
//! registry of its own.

use std::sync::Arc;

use crate::caching::store::{CacheStats, ResponseCache};
use crate::core::config::CachesConfig;

/// The pipeline's cache instances
///
/// Each instance enforces its own capacity and TTL; keys are namespaced per
/// domain so instances can never collide.
pub struct CacheRegistry {
    /// Text-analysis results, keyed by normalized message content
    pub nlp: Arc<ResponseCache>,

    /// Image-analysis results, keyed by content hash
    pub image: Arc<ResponseCache>,

    /// Per-user session data, keyed by user id
    pub session: Arc<ResponseCache>,
}

impl CacheRegistry {
    /// Build all instances from configuration
    pub fn new(config: &CachesConfig) -> Self {
        Self {
            nlp: Arc::new(ResponseCache::new("nlp", config.nlp.clone())),
            image: Arc::new(ResponseCache::new("image", config.image.clone())),
            session: Arc::new(ResponseCache::new("session", config.session.clone())),
        }
    }

    /// All instances, for sweeping and stats aggregation
    pub fn instances(&self) -> [&Arc<ResponseCache>; 3] {
        [&self.nlp, &self.image, &self.session]
    }

    /// Sweep expired entries in every instance; returns total removed
    pub fn sweep_all(&self) -> usize {
        self.instances().iter().map(|cache| cache.sweep()).sum()
    }

    /// Statistics snapshot for every instance
    pub fn stats_all(&self) -> Vec<CacheStats> {
        self.instances().iter().map(|cache| cache.stats()).collect()
    }
}
