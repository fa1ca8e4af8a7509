//! # Failure Recovery Module
//!
//! Retry execution for external calls, driven by the error classifier.
//! Retry decisions are data: the caller supplies an idempotent operation,
//! and the policy consults [`PipelineError::kind`] between attempts —
//! transient failures retry with exponential backoff up to the attempt
//! budget, resource exhaustion gets exactly one delayed retry, and every
//! other kind is returned to the caller immediately.

use crate::core::config::RetryConfig;
use crate::core::error::{ErrorKind, PipelineError, PipelineResult};
use metrics::counter;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff retry policy
///
/// Cheap to clone; coordinators hold one per pipeline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Build a policy from configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }

    /// Policy that never retries, for call sites that must fail fast
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Backoff delay before retrying after the given failed attempt
    /// (1-based). Grows by `multiplier`, capped at `max_delay`, with up to
    /// 50% random jitter when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let with_jitter = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.5))
        } else {
            capped
        };
        Duration::from_millis(with_jitter.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Run `op` until it succeeds, the classifier says stop, or the attempt
    /// budget is spent. The operation must be idempotent: it may be invoked
    /// multiple times for one logical call.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PipelineResult<T>>,
    {
        let mut exhausted_retry_spent = false;

        for attempt in 1..=self.max_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = op_name, attempt, "operation recovered after retry");
                        counter!("retry_recoveries").increment(1);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let kind = err.kind();
                    counter!("retry_failures", "kind" => kind.as_str()).increment(1);

                    let retry_again = match kind {
                        ErrorKind::Transient => attempt < self.max_attempts,
                        // Saturation clears quickly or not at all; one brief
                        // delayed retry, then degrade at the call site.
                        ErrorKind::ResourceExhausted => {
                            !exhausted_retry_spent && attempt < self.max_attempts
                        }
                        ErrorKind::InvalidInput
                        | ErrorKind::ExternalService
                        | ErrorKind::Fatal => false,
                    };

                    if !retry_again {
                        if attempt > 1 {
                            warn!(
                                op = op_name,
                                attempts = attempt,
                                kind = kind.as_str(),
                                error = %err,
                                "giving up after retries"
                            );
                        }
                        return Err(err);
                    }

                    let delay = match kind {
                        ErrorKind::ResourceExhausted => {
                            exhausted_retry_spent = true;
                            self.base_delay
                        }
                        _ => self.delay_for(attempt),
                    };

                    debug!(
                        op = op_name,
                        attempt,
                        kind = kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    counter!("retry_attempts").increment(1);
                    sleep(delay).await;
                }
            }
        }

        // The loop always returns from its final iteration.
        Err(PipelineError::internal(format!(
            "retry loop for '{}' exited without a result",
            op_name
        )))
    }
}
