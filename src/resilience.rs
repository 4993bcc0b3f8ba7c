//! Resilience utilities: retry state machines, bulkheads, scoped timeouts.
//!
//! - [`retry_partially_complete_state`]: fixed backoff while the destination
//!   is mid-resume
//! - [`retry_stuck_replication`]: the same backoff, engaged only right after a
//!   stuck transfer was killed
//! - [`RetryBudget`]: per-step budget for recoverable transfer errors
//! - [`Bulkhead`]: semaphore limiting concurrent replication groups
//! - [`CommandTimeout`]: explicit timeout context for store calls
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> snapshot_replication::Result<()> {
//! use snapshot_replication::config::PartialStateRetryConfig;
//! use snapshot_replication::resilience::retry_partially_complete_state;
//!
//! let config = PartialStateRetryConfig::default();
//! retry_partially_complete_state(&config, || async {
//!     // run_one_transfer_step().await
//!     Ok(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::PartialStateRetryConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

// =============================================================================
// Partially-complete state backoff
// =============================================================================

/// Run `op`, retrying with a fixed backoff while it fails with
/// partially-complete state. Any other error propagates immediately; the
/// last partial-state error propagates after `max_attempts` failures.
pub async fn retry_partially_complete_state<T, F, Fut>(config: &PartialStateRetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_partially_complete_state() && attempt < config.max_attempts => {
                info!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_sec = config.interval_sec,
                    "Destination contains partially-complete state, waiting"
                );
                metrics::record_partial_state_retry();
                tokio::time::sleep(config.interval()).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run `op` after a failed attempt.
///
/// When `previous` was a stuck transfer the receiving side may still be
/// unwinding it, so a partially-complete state error is waited out. Otherwise
/// `op` runs once.
pub async fn retry_stuck_replication<T, F, Fut>(
    config: &PartialStateRetryConfig,
    previous: Option<&ReplicationError>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if previous.is_some_and(ReplicationError::is_possibly_stuck) {
        retry_partially_complete_state(config, op).await
    } else {
        op().await
    }
}

// =============================================================================
// Retry budget
// =============================================================================

/// Retry budget for one snapshot step. Reset when a step succeeds.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    retries: u32,
    failures: u32,
}

impl RetryBudget {
    pub fn new(retries: u32) -> Self {
        Self { retries, failures: 0 }
    }

    /// Record a failure. `true` if the step may be attempted again.
    pub fn record_failure(&mut self, error: &ReplicationError) -> bool {
        if !error.is_retryable() {
            return false;
        }
        self.failures += 1;
        self.failures <= self.retries
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// =============================================================================
// Bulkhead (Concurrency Limiter)
// =============================================================================

/// Error when bulkhead is closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead closed: max {max_concurrent} concurrent operations")]
pub struct BulkheadClosed {
    /// Maximum concurrent operations allowed.
    pub max_concurrent: usize,
}

/// Limits how many replication groups run at once.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Create a new bulkhead with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Bulkhead for replication groups. `None` means effectively unlimited.
    pub fn for_replication(max: Option<usize>) -> Self {
        Self::new(max.unwrap_or(Semaphore::MAX_PERMITS).max(1))
    }

    /// Acquire a permit, waiting if necessary.
    ///
    /// Returns a permit that releases the slot when dropped.
    pub async fn acquire(&self) -> std::result::Result<OwnedSemaphorePermit, BulkheadClosed> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadClosed {
                max_concurrent: self.max_concurrent,
            })
    }
}

// =============================================================================
// Scoped command timeout
// =============================================================================

/// Timeout applied to external calls, passed explicitly to whoever makes them.
///
/// On expiry the wrapped future is dropped, which hard-stops the call, and
/// [`ReplicationError::Timeout`] is returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandTimeout {
    timeout: Option<Duration>,
}

impl CommandTimeout {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn none() -> Self {
        Self { timeout: None }
    }

    /// Run `fut` under this timeout.
    pub async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match self.timeout {
            None => fut.await,
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(operation, timeout_sec = timeout.as_secs(), "Command timed out");
                    Err(ReplicationError::Timeout {
                        operation: operation.to_string(),
                        timeout,
                    })
                }
            },
        }
    }
}
