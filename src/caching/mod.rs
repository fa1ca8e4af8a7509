//! # Caching System Module
//!
//! The layered cache side of the pipeline: independently configured
//! response-cache instances per semantic domain, deterministic key
//! derivation, the event deduplication store, and a background monitor that
//! sweeps expired state.
//!
//! ## Architecture
//! 1. **Store**: one LRU+TTL instance per domain, single lock domain each
//! 2. **Keys**: fingerprints and cache keys from semantically relevant inputs
//! 3. **Dedup**: atomic test-and-set over delivery fingerprints
//! 4. **Registry**: explicit construction and injection of all instances
//! 5. **Monitor**: periodic sweeps and a diagnostic report

pub mod dedup;
pub mod keys;
pub mod monitor;
pub mod registry;
pub mod store;

pub use dedup::{DedupState, DedupStore, RegisterOutcome};
pub use monitor::CacheMonitor;
pub use registry::CacheRegistry;
pub use store::{CacheStats, ResponseCache};
