//! # Connection Pool Module
//!
//! Bounded pool of reusable downstream connections (the database in the
//! surrounding system), generic over a [`ConnectionFactory`] so tests and
//! alternate backends can inject their own connection type.
//!
//! ## Rust Concepts Used
//!
//! - `Arc<T>` for shared ownership of the pool across request handlers
//! - `tokio::sync::Semaphore` with owned permits to bound live connections
//! - `parking_lot::Mutex` for the idle list, so the RAII guard can return a
//!   connection from a synchronous `Drop`
//! - `async_trait` for async methods in the factory trait
//!
//! Scoped-acquisition discipline: `acquire` hands out a [`PoolGuard`], and
//! dropping the guard is the release — so every acquire is paired with
//! exactly one release on all exit paths, including early returns and `?`.
//! A broken connection is discarded on release and replaced lazily by the
//! next acquire, not eagerly, so a flapping downstream does not trigger a
//! reconnect storm.

use async_trait::async_trait;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::PoolConfig;
use crate::core::error::{PipelineError, PipelineResult};

/// Factory for the pool's underlying connections
///
/// `validate` is consulted before handing out a connection that has sat idle
/// past the staleness threshold; returning `false` discards it.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open a fresh connection
    async fn connect(&self) -> PipelineResult<Self::Conn>;

    /// Check that an idle connection is still usable
    async fn validate(&self, conn: &mut Self::Conn) -> bool;
}

/// A connection at rest in the pool, with lifecycle bookkeeping
struct PooledConn<C> {
    conn: C,
    connection_id: Uuid,
    created_at: Instant,
    last_used: Instant,
}

impl<C> PooledConn<C> {
    fn new(conn: C) -> Self {
        let now = Instant::now();
        Self {
            conn,
            connection_id: Uuid::new_v4(),
            created_at: now,
            last_used: now,
        }
    }

    fn is_stale(&self, threshold: std::time::Duration) -> bool {
        self.last_used.elapsed() > threshold
    }
}

/// Snapshot of pool state for stats endpoints and tests
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub live: usize,
    pub max_size: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
    pub timeouts: u64,
}

/// Bounded connection pool
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,

    /// Idle connections, most recently used at the back
    idle: Mutex<VecDeque<PooledConn<F::Conn>>>,

    /// One permit per live-or-creatable connection; bounds borrowed count
    permits: Arc<Semaphore>,

    in_use: AtomicUsize,
    live: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create an empty pool; call [`initialize`](Self::initialize) to
    /// pre-open the configured minimum.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            factory,
            config,
            idle: Mutex::new(VecDeque::new()),
            permits,
            in_use: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Pre-open connections up to the configured minimum
    ///
    /// Failures are logged and stop the fill; the pool still works, it just
    /// opens connections on demand instead. Returns how many were opened.
    pub async fn initialize(&self) -> usize {
        let mut opened = 0;
        while self.live.load(Ordering::SeqCst) < self.config.min_size {
            match self.factory.connect().await {
                Ok(conn) => {
                    self.live.fetch_add(1, Ordering::SeqCst);
                    self.created.fetch_add(1, Ordering::Relaxed);
                    self.idle.lock().push_back(PooledConn::new(conn));
                    opened += 1;
                }
                Err(e) => {
                    warn!(error = %e, "connection prewarm stopped early");
                    break;
                }
            }
        }
        if opened > 0 {
            info!(opened, min_size = self.config.min_size, "connection pool initialized");
        }
        opened
    }

    /// Borrow a connection, waiting up to the configured acquire timeout
    ///
    /// Returns a [`PoolGuard`] whose `Drop` is the release. Timing out maps
    /// to [`PipelineError::PoolExhausted`], which classifies as
    /// resource exhaustion.
    pub async fn acquire(&self) -> PipelineResult<PoolGuard<'_, F>> {
        let start = Instant::now();

        let permit = match timeout(
            self.config.acquire_timeout,
            self.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(PipelineError::internal("connection pool semaphore closed"))
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                counter!("pool_acquire_timeouts").increment(1);
                warn!(
                    timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                    "no pooled connection available within acquire timeout"
                );
                return Err(PipelineError::PoolExhausted {
                    timeout_ms: self.config.acquire_timeout.as_millis() as u64,
                });
            }
        };

        let slot = self.checkout_idle().await?;

        self.in_use.fetch_add(1, Ordering::SeqCst);
        gauge!("pool_in_use").increment(1.0);
        histogram!("pool_acquire_duration_seconds").record(start.elapsed().as_secs_f64());

        Ok(PoolGuard {
            pool: self,
            slot: Some(slot),
            _permit: permit,
            broken: false,
        })
    }

    /// Pop a usable idle connection, revalidating stale ones, or open a new
    /// connection when none qualifies. Caller must hold a permit.
    async fn checkout_idle(&self) -> PipelineResult<PooledConn<F::Conn>> {
        loop {
            let candidate = self.idle.lock().pop_front();
            let Some(mut slot) = candidate else { break };

            if !slot.is_stale(self.config.stale_after) {
                self.reused.fetch_add(1, Ordering::Relaxed);
                counter!("pool_connections_reused").increment(1);
                return Ok(slot);
            }

            if self.factory.validate(&mut slot.conn).await {
                debug!(connection_id = %slot.connection_id, "stale connection revalidated");
                self.reused.fetch_add(1, Ordering::Relaxed);
                counter!("pool_connections_reused").increment(1);
                return Ok(slot);
            }

            debug!(
                connection_id = %slot.connection_id,
                idle_secs = slot.last_used.elapsed().as_secs(),
                "discarding stale connection"
            );
            self.discard_one();
        }

        let conn = self.factory.connect().await?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::Relaxed);
        counter!("pool_connections_created").increment(1);
        let slot = PooledConn::new(conn);
        debug!(connection_id = %slot.connection_id, "opened new pooled connection");
        Ok(slot)
    }

    fn discard_one(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        counter!("pool_connections_discarded").increment(1);
    }

    /// Release path invoked by `PoolGuard::drop`
    fn release(&self, mut slot: PooledConn<F::Conn>, broken: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        gauge!("pool_in_use").decrement(1.0);

        if broken {
            debug!(connection_id = %slot.connection_id, "dropping broken connection");
            self.discard_one();
            return;
        }

        slot.last_used = Instant::now();
        self.idle.lock().push_back(slot);
    }

    /// Drop idle connections unused past the staleness threshold
    ///
    /// Replacement stays lazy; the next acquire reopens as needed.
    pub fn sweep_stale(&self) -> usize {
        let mut idle = self.idle.lock();
        let before = idle.len();
        let threshold = self.config.stale_after;
        idle.retain(|slot| !slot.is_stale(threshold));
        let removed = before - idle.len();
        drop(idle);

        for _ in 0..removed {
            self.discard_one();
        }
        if removed > 0 {
            debug!(removed, "swept stale idle connections");
        }
        removed
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            in_use: self.in_use.load(Ordering::SeqCst),
            live: self.live.load(Ordering::SeqCst),
            max_size: self.config.max_size,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// RAII borrow of a pooled connection
///
/// Dereferences to the factory's connection type. Dropping the guard returns
/// the connection to the idle set — or discards it if
/// [`mark_broken`](Self::mark_broken) was called — and frees the permit.
pub struct PoolGuard<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    slot: Option<PooledConn<F::Conn>>,
    _permit: OwnedSemaphorePermit,
    broken: bool,
}

impl<F: ConnectionFactory> PoolGuard<'_, F> {
    /// Flag the connection as unusable; it will be discarded on release
    /// instead of returned to the idle set.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Identifier of the underlying connection, for log correlation
    pub fn connection_id(&self) -> Uuid {
        self.slot.as_ref().map(|s| s.connection_id).unwrap_or_default()
    }

    /// Age of the underlying connection
    pub fn age(&self) -> std::time::Duration {
        self.slot
            .as_ref()
            .map(|s| s.created_at.elapsed())
            .unwrap_or_default()
    }
}

impl<F: ConnectionFactory> Deref for PoolGuard<'_, F> {
    type Target = F::Conn;

    fn deref(&self) -> &Self::Target {
        // Invariant: slot is Some until drop.
        &self.slot.as_ref().unwrap().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PoolGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().unwrap().conn
    }
}

impl<F: ConnectionFactory> Drop for PoolGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot, self.broken);
        }
    }
}
