//! Upward event notifications.
//!
//! Observers are best-effort: a failing or panicking observer is logged and
//! counted, never propagated into the engine.

use crate::error::Result;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Events published by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    PeriodicSnapshotTaskStart {
        task_id: String,
    },
    PeriodicSnapshotTaskSuccess {
        task_id: String,
    },
    PeriodicSnapshotTaskError {
        task_id: String,
        error: String,
    },
    ReplicationTaskStart {
        task_id: String,
    },
    ReplicationTaskSnapshotStart {
        task_id: String,
        dataset: String,
        snapshot: String,
        snapshots_sent: usize,
        snapshots_total: usize,
    },
    ReplicationTaskSnapshotSuccess {
        task_id: String,
        dataset: String,
        snapshot: String,
        snapshots_sent: usize,
        snapshots_total: usize,
    },
    /// `src_size` estimates the total, `dst_size` is what has arrived so far.
    ReplicationTaskDataProgress {
        task_id: String,
        dataset: String,
        src_size: u64,
        dst_size: u64,
    },
    ReplicationTaskSuccess {
        task_id: String,
        warnings: Vec<String>,
    },
    ReplicationTaskError {
        task_id: String,
        error: String,
    },
}

pub trait Observer: Send + Sync {
    fn notify(&self, event: &ObserverEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpObserver;

impl Observer for NoOpObserver {
    fn notify(&self, _event: &ObserverEvent) -> Result<()> {
        Ok(())
    }
}

/// Deliver `event`, swallowing errors and panics.
pub fn notify(observer: &dyn Observer, event: ObserverEvent) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| observer.notify(&event)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(event = ?event, error = %e, "Observer failed");
            crate::metrics::record_observer_error();
        }
        Err(_) => {
            error!(event = ?event, "Observer panicked");
            crate::metrics::record_observer_error();
        }
    }
}

/// Await `fut`, converting a panic into `None`. Used for best-effort
/// background reporting loops.
pub async fn catch_panic<T>(fut: impl std::future::Future<Output = T>) -> Option<T> {
    AssertUnwindSafe(fut).catch_unwind().await.ok()
}
