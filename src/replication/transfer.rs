//! Running a single transfer step under supervision.
//!
//! A step is the transfer primitive plus two background loops: the stuck
//! monitor, which kills the transfer when the destination's resume token stops
//! advancing, and a best-effort progress reporter.

use crate::config::{Direction, StuckMonitorConfig};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::observer::{self, Observer, ObserverEvent};
use crate::replication::plan::ReplicationStep;
use crate::transport::{
    get_properties, PropertyKind, ReplicationTransport, SnapshotStore, TransferOptions, TransferOutcome,
    TransferProcess,
};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// StuckMonitor
// ═══════════════════════════════════════════════════════════════════════════════

/// Detects a receive whose resume token stopped changing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckMonitor {
    interval: Duration,
    window: usize,
}

impl StuckMonitor {
    pub fn new(interval: Duration, window: usize) -> Self {
        Self {
            interval,
            window: window.max(1),
        }
    }

    /// `None` when monitoring is disabled.
    pub fn from_config(config: &StuckMonitorConfig) -> Option<Self> {
        config.enabled.then(|| Self::new(config.interval(), config.window))
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Poll `token` every interval until told to stop.
    ///
    /// Returns `false` as soon as the last `window` polled tokens are
    /// identical, `true` when `stop` fires first. Polls that fail or find no
    /// token are not observations and leave the window untouched.
    pub async fn run<F, Fut>(&self, mut stop: watch::Receiver<bool>, mut token: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        let mut tokens: VecDeque<String> = VecDeque::with_capacity(self.window);
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return true;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match token().await {
                Ok(Some(current)) => {
                    if tokens.len() == self.window {
                        tokens.pop_front();
                    }
                    tokens.push_back(current);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(error = %e, "Resume token poll failed");
                    continue;
                }
            }

            if tokens.len() == self.window && tokens.iter().all(|t| *t == tokens[0]) {
                return false;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransferRunner
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs steps for one replication task.
pub struct TransferRunner<'a> {
    pub task_id: &'a str,
    pub direction: Direction,
    pub transport: &'a dyn ReplicationTransport,
    pub src_store: &'a dyn SnapshotStore,
    pub dst_store: &'a dyn SnapshotStore,
    pub monitor: Option<StuckMonitor>,
    pub progress_interval: Duration,
    pub observer: &'a dyn Observer,
}

impl TransferRunner<'_> {
    /// Run `step` to completion, or until the stuck monitor fires.
    ///
    /// The monitor is always stopped before this returns, and the process is
    /// stopped whenever the monitor finishes first.
    pub async fn run(&self, step: &ReplicationStep, options: TransferOptions) -> Result<TransferOutcome> {
        debug!(task_id = self.task_id, step = %step, "Starting transfer");
        let process = self
            .transport
            .spawn_transfer(self.direction, step.clone(), options)
            .await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = async {
            match &self.monitor {
                Some(monitor) => {
                    monitor
                        .run(stop_rx, || self.dst_store.get_resume_token(&step.dst_dataset))
                        .await
                }
                None => {
                    let mut stop_rx = stop_rx;
                    let _ = stop_rx.changed().await;
                    true
                }
            }
        };

        let progress = async {
            if observer::catch_panic(self.report_progress(step)).await.is_none() {
                warn!(task_id = self.task_id, "Progress reporter panicked");
            }
            std::future::pending::<bool>().await
        };
        let supervision = async {
            tokio::select! {
                progressing = monitor => progressing,
                progressing = progress => progressing,
            }
        };
        tokio::pin!(supervision);

        tokio::select! {
            outcome = process.wait() => {
                let _ = stop_tx.send(true);
                supervision.await;
                outcome
            }
            progressing = &mut supervision => {
                if progressing {
                    warn!(task_id = self.task_id, "Stuck monitor stopped unexpectedly, stopping transfer");
                    self.stop(process.as_ref()).await;
                    return Err(ReplicationError::Internal("stuck monitor stopped unexpectedly".to_string()));
                }
                let window = self.monitor.map_or(0, |m| m.window());
                warn!(
                    task_id = self.task_id,
                    dataset = %step.dst_dataset,
                    polls = window,
                    "Resume token did not change, stopping stuck transfer"
                );
                metrics::record_stuck_transfer(&step.dst_dataset);
                self.stop(process.as_ref()).await;
                Err(ReplicationError::StuckTransfer {
                    dataset: step.dst_dataset.clone(),
                    polls: window,
                })
            }
        }
    }

    async fn stop(&self, process: &dyn TransferProcess) {
        if let Err(e) = process.stop().await {
            warn!(task_id = self.task_id, error = %e, "Failed to stop transfer");
        }
    }

    async fn report_progress(&self, step: &ReplicationStep) {
        let mut src_size = None;
        loop {
            tokio::time::sleep(self.progress_interval).await;

            if src_size.is_none() {
                src_size = self.dataset_size(self.src_store, &step.src_dataset, "referenced").await;
            }
            let (Some(src_size), Some(dst_size)) =
                (src_size, self.dataset_size(self.dst_store, &step.dst_dataset, "used").await)
            else {
                continue;
            };

            observer::notify(
                self.observer,
                ObserverEvent::ReplicationTaskDataProgress {
                    task_id: self.task_id.to_string(),
                    dataset: step.src_dataset.clone(),
                    src_size,
                    dst_size,
                },
            );
        }
    }

    async fn dataset_size(&self, store: &dyn SnapshotStore, dataset: &str, property: &str) -> Option<u64> {
        match get_properties(store, dataset, &[(property, PropertyKind::Bytes)]).await {
            Ok(properties) => properties.get(property).and_then(|v| v.as_bytes()),
            Err(e) => {
                debug!(dataset, property, error = %e, "Size query failed");
                None
            }
        }
    }
}
