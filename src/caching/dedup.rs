//! # Event Deduplication Store
//!
//! The upstream platform delivers at least once; this store makes processing
//! at most once. `register` is a single test-and-set on a concurrent map —
//! not a test followed by a set — because two deliveries of the same event
//! can race, and exactly one of them may win.
//!
//! A record outlives the pipeline run that created it: it stays on file for
//! the retention window so later redeliveries are still recognized. The
//! window must exceed the platform's maximum redelivery delay; that delay is
//! an undocumented platform property, so the default is deliberately large
//! and the window is configurable.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

use crate::core::config::DedupConfig;
use crate::core::error::{PipelineError, PipelineResult};

/// Processing state of a registered fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupState {
    /// A pipeline run currently owns this event
    InProgress,
    /// The pipeline finished (success or terminal failure)
    Completed,
}

/// Outcome of attempting to register a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First sighting within the retention window; the caller proceeds
    Accepted,
    /// An equal fingerprint is already on record; the caller must skip
    /// processing. For `InProgress`, a concurrent attempt is already
    /// handling the event and a no-op acknowledgement is appropriate.
    Duplicate { state: DedupState },
}

#[derive(Debug)]
struct DedupRecord {
    state: DedupState,
    first_seen_at: Instant,
}

/// Fingerprint store with bounded retention
pub struct DedupStore {
    config: DedupConfig,
    records: DashMap<String, DedupRecord>,

    accepted: AtomicU64,
    duplicates: AtomicU64,
    fail_open_accepts: AtomicU64,
}

impl DedupStore {
    /// Create a store from configuration
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            fail_open_accepts: AtomicU64::new(0),
        }
    }

    /// Atomically claim a fingerprint
    ///
    /// Returns `Accepted` exactly once per fingerprint per retention window,
    /// no matter how many concurrent deliveries race here. A record older
    /// than the window is logically absent and is reclaimed by the winning
    /// register.
    ///
    /// When the store is at capacity and cannot record a new fingerprint,
    /// the configured policy applies: fail-open accepts the event with a
    /// warning (double processing is bounded and recoverable for this
    /// workload), fail-closed rejects it.
    pub fn register(&self, fingerprint: &str) -> PipelineResult<RegisterOutcome> {
        // Capacity is checked before entry(): len() cannot run while the
        // entry's shard lock is held. The check races with concurrent
        // inserts, so the bound is approximate between sweeps.
        if self.records.len() >= self.config.max_entries
            && !self.records.contains_key(fingerprint)
        {
            return self.handle_capacity_exhausted(fingerprint);
        }

        match self.records.entry(fingerprint.to_string()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get();
                if record.first_seen_at.elapsed() > self.config.retention {
                    // Expired record: treat as first sighting.
                    occupied.insert(DedupRecord {
                        state: DedupState::InProgress,
                        first_seen_at: Instant::now(),
                    });
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    counter!("dedup_accepted").increment(1);
                    return Ok(RegisterOutcome::Accepted);
                }

                let state = record.state;
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                counter!("dedup_duplicates").increment(1);
                debug!(fingerprint, state = ?state, "duplicate delivery rejected");
                Ok(RegisterOutcome::Duplicate { state })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DedupRecord {
                    state: DedupState::InProgress,
                    first_seen_at: Instant::now(),
                });
                self.accepted.fetch_add(1, Ordering::Relaxed);
                counter!("dedup_accepted").increment(1);
                Ok(RegisterOutcome::Accepted)
            }
        }
    }

    fn handle_capacity_exhausted(&self, fingerprint: &str) -> PipelineResult<RegisterOutcome> {
        if self.config.fail_open {
            warn!(
                fingerprint,
                max_entries = self.config.max_entries,
                "dedup store full; accepting without a record"
            );
            self.fail_open_accepts.fetch_add(1, Ordering::Relaxed);
            counter!("dedup_fail_open_accepts").increment(1);
            Ok(RegisterOutcome::Accepted)
        } else {
            warn!(
                fingerprint,
                max_entries = self.config.max_entries,
                "dedup store full; rejecting event"
            );
            Err(PipelineError::store(
                "deduplication store is at capacity".to_string(),
            ))
        }
    }

    /// Mark a fingerprint's pipeline as finished
    ///
    /// Idempotent: completing twice, or completing a fingerprint the store
    /// never recorded (fail-open accept), is a no-op.
    pub fn complete(&self, fingerprint: &str) {
        if let Some(mut record) = self.records.get_mut(fingerprint) {
            record.state = DedupState::Completed;
        }
    }

    /// Remove records older than the retention window; returns how many
    pub fn sweep(&self) -> usize {
        let retention = self.config.retention;
        let before = self.records.len();
        self.records
            .retain(|_, record| record.first_seen_at.elapsed() <= retention);
        let removed = before - self.records.len();
        gauge!("dedup_records").set(self.records.len() as f64);
        if removed > 0 {
            debug!(removed, "swept expired dedup records");
        }
        removed
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// (accepted, duplicate, fail-open) counts since construction
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.accepted.load(Ordering::Relaxed),
            self.duplicates.load(Ordering::Relaxed),
            self.fail_open_accepts.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn store(retention: Duration) -> DedupStore {
        DedupStore::new(DedupConfig {
            retention,
            max_entries: 100,
            fail_open: true,
        })
    }

    #[test]
    fn test_first_sighting_accepted_then_duplicate() {
        let store = store(Duration::from_secs(60));

        assert_eq!(store.register("fp-1").unwrap(), RegisterOutcome::Accepted);
        assert_eq!(
            store.register("fp-1").unwrap(),
            RegisterOutcome::Duplicate {
                state: DedupState::InProgress
            }
        );

        store.complete("fp-1");
        assert_eq!(
            store.register("fp-1").unwrap(),
            RegisterOutcome::Duplicate {
                state: DedupState::Completed
            }
        );
    }

    #[test]
    fn test_complete_is_idempotent() {
        let store = store(Duration::from_secs(60));
        store.register("fp-1").unwrap();
        store.complete("fp-1");
        store.complete("fp-1");
        store.complete("never-registered");
        assert_eq!(
            store.register("fp-1").unwrap(),
            RegisterOutcome::Duplicate {
                state: DedupState::Completed
            }
        );
    }

    #[tokio::test]
    async fn test_expired_record_accepts_again() {
        let store = store(Duration::from_millis(30));
        assert_eq!(store.register("fp-1").unwrap(), RegisterOutcome::Accepted);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.register("fp-1").unwrap(), RegisterOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_sweep_removes_old_records() {
        let store = store(Duration::from_millis(30));
        store.register("fp-1").unwrap();
        store.register("fp-2").unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.sweep(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registers_accept_exactly_once() {
        let store = Arc::new(store(Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.register("same-fingerprint").unwrap()
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() == RegisterOutcome::Accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_fail_open_at_capacity() {
        let store = DedupStore::new(DedupConfig {
            retention: Duration::from_secs(60),
            max_entries: 2,
            fail_open: true,
        });
        store.register("fp-1").unwrap();
        store.register("fp-2").unwrap();

        // Full, unknown fingerprint: accepted but unrecorded.
        assert_eq!(store.register("fp-3").unwrap(), RegisterOutcome::Accepted);
        assert_eq!(store.len(), 2);
        assert_eq!(store.counters().2, 1);

        // Known fingerprints still dedup while full.
        assert!(matches!(
            store.register("fp-1").unwrap(),
            RegisterOutcome::Duplicate { .. }
        ));
    }

    #[test]
    fn test_fail_closed_at_capacity() {
        let store = DedupStore::new(DedupConfig {
            retention: Duration::from_secs(60),
            max_entries: 1,
            fail_open: false,
        });
        store.register("fp-1").unwrap();
        assert!(store.register("fp-2").is_err());
    }
}
