//! Engine state types.
//!
//! Defines the state machine for the replication engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  run()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown() / run-once clock exhausted
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ReplicationEngine::new()`. Nothing scheduled.
//! - **Running**: Scheduler loop active. Snapshots, retention and replication run on ticks.
//! - **ShuttingDown**: Scheduler loop stopped. Background replication groups draining.
//! - **Stopped**: Graceful shutdown complete. Safe to drop.
//!
//! An invalid configuration never produces an engine: `new()` fails instead.

use std::collections::HashSet;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`run()`](super::ReplicationEngine::run) to begin scheduling.
    Created,

    /// Scheduler loop running.
    Running,

    /// Waiting for in-flight replication groups to finish.
    ShuttingDown,

    /// Engine has shut down cleanly.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Replication tasks currently running and the local datasets they touch.
///
/// Local retention skips datasets under a running transfer and records that
/// it did, so the pass can be re-queued once the transfer finishes.
#[derive(Debug, Default)]
pub struct RunningTransfers {
    tasks: HashSet<String>,
    datasets: Vec<(String, String)>,
    retention_deferred: bool,
}

impl RunningTransfers {
    /// Mark `task_id` running. `false` if it already was.
    pub fn start(&mut self, task_id: &str, local_datasets: impl IntoIterator<Item = String>) -> bool {
        if !self.tasks.insert(task_id.to_string()) {
            return false;
        }
        self.datasets
            .extend(local_datasets.into_iter().map(|dataset| (task_id.to_string(), dataset)));
        true
    }

    /// Mark `task_id` finished. Returns `true` if retention was deferred
    /// while anything was running and should now be re-queued.
    pub fn finish(&mut self, task_id: &str) -> bool {
        self.tasks.remove(task_id);
        self.datasets.retain(|(id, _)| id != task_id);
        std::mem::take(&mut self.retention_deferred)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tasks.contains(task_id)
    }

    /// `true` if `dataset` is inside a running transfer's local subtree.
    pub fn is_busy(&self, dataset: &str) -> bool {
        self.datasets
            .iter()
            .any(|(_, root)| crate::dataset::is_child(dataset, root))
    }

    pub fn defer_retention(&mut self) {
        self.retention_deferred = true;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
