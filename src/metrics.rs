//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Periodic snapshot creation
//! - Retention passes and destroyed snapshots
//! - Replication task outcomes and transfer steps
//! - Stuck transfers and partial-state backoff
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `snapshot_replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use snapshot_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_snapshot_created("hourly");
//! metrics::record_transfer_step("offsite", true, Duration::from_secs(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a periodic snapshot created.
pub fn record_snapshot_created(task_id: &str) {
    counter!("snapshot_replication_snapshots_created_total", "task_id" => task_id.to_string()).increment(1);
}

/// Record a periodic snapshot skipped (already taken this tick, empty, DST repeat).
pub fn record_snapshot_skipped(task_id: &str, reason: &'static str) {
    counter!("snapshot_replication_snapshots_skipped_total", "task_id" => task_id.to_string(), "reason" => reason)
        .increment(1);
}

/// Record a periodic snapshot task failure.
pub fn record_snapshot_error(task_id: &str) {
    counter!("snapshot_replication_snapshot_errors_total", "task_id" => task_id.to_string()).increment(1);
}

/// Record a retention pass.
pub fn record_retention_run(side: &'static str, destroyed: usize, failed: usize, duration: Duration) {
    counter!("snapshot_replication_retention_runs_total", "side" => side).increment(1);
    counter!("snapshot_replication_snapshots_destroyed_total", "side" => side).increment(destroyed as u64);
    if failed > 0 {
        counter!("snapshot_replication_destroy_failures_total", "side" => side).increment(failed as u64);
    }
    histogram!("snapshot_replication_retention_duration_seconds", "side" => side).record(duration.as_secs_f64());
}

/// Record datasets whose retention was deferred behind a running transfer.
pub fn record_retention_deferred(datasets: usize) {
    counter!("snapshot_replication_retention_deferred_total").increment(datasets as u64);
}

/// Record a replication task outcome.
pub fn record_replication_task(task_id: &str, outcome: &'static str, duration: Duration) {
    counter!("snapshot_replication_tasks_total", "task_id" => task_id.to_string(), "outcome" => outcome).increment(1);
    histogram!("snapshot_replication_task_duration_seconds", "task_id" => task_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record one snapshot step transfer.
pub fn record_transfer_step(task_id: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("snapshot_replication_transfer_steps_total", "task_id" => task_id.to_string(), "status" => status)
        .increment(1);
    histogram!("snapshot_replication_transfer_step_duration_seconds", "task_id" => task_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a transfer retried after a recoverable error.
pub fn record_transfer_retry(task_id: &str) {
    counter!("snapshot_replication_transfer_retries_total", "task_id" => task_id.to_string()).increment(1);
}

/// Record a transfer killed by the stuck monitor.
pub fn record_stuck_transfer(dataset: &str) {
    counter!("snapshot_replication_stuck_transfers_total", "dataset" => dataset.to_string()).increment(1);
}

/// Record a partially-complete state backoff.
pub fn record_partial_state_retry() {
    counter!("snapshot_replication_partial_state_retries_total").increment(1);
}

/// Record an observer callback that failed or panicked.
pub fn record_observer_error() {
    counter!("snapshot_replication_observer_errors_total").increment(1);
}

/// Set the number of replication groups currently running.
pub fn set_running_replication_groups(count: usize) {
    gauge!("snapshot_replication_running_groups").set(count as f64);
}

/// Set engine state (as numeric gauge for alerting).
///
/// Values: 0=Created, 1=Running, 2=ShuttingDown, 3=Stopped
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("snapshot_replication_engine_state").set(value);
}
