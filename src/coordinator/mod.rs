// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The minute [`Scheduler`] and its interrupt queue
//! - Periodic snapshot creation via [`periodic`]
//! - Background replication groups via [`replication`]
//! - Local retention via [`retention`]
//!
//! # Architecture
//!
//! Every scheduler tick runs, in order:
//! 1. Due periodic snapshot tasks (sequentially, in a fixed order)
//! 2. Replication tasks that are due, or bound to a snapshot task that just ran
//! 3. Local retention, if snapshots were taken or a pass was re-queued
//!
//! Replication groups run in the background; the tick loop never waits for them.

mod periodic;
mod replication;
mod retention;
mod types;

pub use types::{EngineState, RunningTransfers};

use crate::config::{EngineConfig, EngineSettings};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::observer::Observer;
use crate::resilience::{Bulkhead, CommandTimeout};
use crate::schedule::{Clock, InterruptHandle, ScheduledTask, Scheduler, SchedulerTick, TimeSource, TzClock};
use crate::task::{build_tasks, PeriodicSnapshotTask, ReplicationTask};
use crate::transport::{SnapshotStore, TransportFactory};
use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each in-flight replication group.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared between the tick loop and background replication groups.
pub(crate) struct EngineContext {
    pub settings: EngineSettings,
    pub tz: Tz,
    pub local_store: Arc<dyn SnapshotStore>,
    pub transports: Arc<dyn TransportFactory>,
    pub observer: Arc<dyn Observer>,
    pub time_source: Arc<dyn TimeSource>,
    pub command_timeout: CommandTimeout,
    pub bulkhead: Bulkhead,
    pub periodic_tasks: Vec<Arc<PeriodicSnapshotTask>>,
    pub replication_tasks: Vec<Arc<ReplicationTask>>,
    pub interrupts: InterruptHandle,
    pub running_groups: AtomicUsize,
    /// Deferred retention was re-queued through an interrupt
    pub retention_requeued: AtomicBool,
    removal_dates: RwLock<HashMap<String, DateTime<Utc>>>,
    running: Mutex<RunningTransfers>,
}

impl EngineContext {
    /// Current wall-clock time in the engine's timezone.
    pub fn now_local(&self) -> NaiveDateTime {
        self.time_source.now().with_timezone(&self.tz).naive_local()
    }

    pub fn running(&self) -> MutexGuard<'_, RunningTransfers> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn removal_dates(&self) -> HashMap<String, DateTime<Utc>> {
        match self.removal_dates.read() {
            Ok(dates) => dates.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// The snapshot replication engine.
///
/// Drives periodic snapshots, replication and retention from a minute
/// scheduler until [`shutdown()`](Self::shutdown) is called, or after a single
/// tick when configured with `once`.
///
/// ```rust,ignore
/// let engine = Arc::new(ReplicationEngine::new(config, store, transports, observer, time_source)?);
/// let runner = tokio::spawn({
///     let engine = Arc::clone(&engine);
///     async move { engine.run().await }
/// });
///
/// engine.shutdown();
/// runner.await??;
/// ```
pub struct ReplicationEngine {
    ctx: Arc<EngineContext>,

    /// Scheduler, owned by the tick loop while `run()` is active
    scheduler: tokio::sync::Mutex<Scheduler>,

    /// Exit after the first tick
    once: bool,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Background replication groups
    group_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Create a new engine.
    ///
    /// Fails with [`ReplicationError::Config`] if the configuration does not
    /// describe a valid task set. The engine starts in `Created` state.
    pub fn new(
        config: EngineConfig,
        local_store: Arc<dyn SnapshotStore>,
        transports: Arc<dyn TransportFactory>,
        observer: Arc<dyn Observer>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let tz = config.tz()?;
        let command_timeout = CommandTimeout::new(config.settings.command_timeout_duration()?);
        let (periodic_tasks, replication_tasks) = build_tasks(&config)?;

        let mut scheduler = Scheduler::new(Clock::new(Arc::clone(&time_source), config.once), TzClock::new(tz));
        let mut scheduled: Vec<ScheduledTask> = periodic_tasks
            .iter()
            .map(|task| ScheduledTask::PeriodicSnapshot(Arc::clone(task)))
            .collect();
        scheduled.extend(
            replication_tasks
                .iter()
                .map(|task| ScheduledTask::Replication(Arc::clone(task))),
        );
        scheduler.set_tasks(scheduled);

        info!(
            timezone = %tz,
            periodic_snapshot_tasks = periodic_tasks.len(),
            replication_tasks = replication_tasks.len(),
            once = config.once,
            "Replication engine configured"
        );

        let ctx = EngineContext {
            settings: config.settings,
            tz,
            local_store,
            transports,
            observer,
            time_source,
            command_timeout,
            bulkhead: Bulkhead::for_replication(config.max_parallel_replication_tasks),
            periodic_tasks,
            replication_tasks,
            interrupts: scheduler.interrupt_handle(),
            running_groups: AtomicUsize::new(0),
            retention_requeued: AtomicBool::new(false),
            removal_dates: RwLock::new(HashMap::new()),
            running: Mutex::new(RunningTransfers::default()),
        };

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            ctx: Arc::new(ctx),
            scheduler: tokio::sync::Mutex::new(scheduler),
            once: config.once,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            group_handles: Mutex::new(Vec::new()),
        })
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Periodic snapshot tasks, in configuration order.
    pub fn periodic_snapshot_tasks(&self) -> &[Arc<PeriodicSnapshotTask>] {
        &self.ctx.periodic_tasks
    }

    /// Replication tasks, in configuration order.
    pub fn replication_tasks(&self) -> &[Arc<ReplicationTask>] {
        &self.ctx.replication_tasks
    }

    /// Replace the externally scheduled deletions, keyed by `dataset@name`.
    pub fn set_removal_dates(&self, dates: HashMap<String, DateTime<Utc>>) {
        match self.ctx.removal_dates.write() {
            Ok(mut current) => *current = dates,
            Err(poisoned) => *poisoned.into_inner() = dates,
        }
    }

    /// Run a replication task on the next interrupt tick, regardless of its
    /// schedule.
    pub fn run_replication_task_now(&self, task_id: &str) -> Result<()> {
        let task = self
            .ctx
            .replication_tasks
            .iter()
            .find(|task| task.id == task_id)
            .ok_or_else(|| ReplicationError::Config(format!("Unknown replication task '{task_id}'")))?;
        info!(task_id, "Queueing replication task");
        self.ctx
            .interrupts
            .interrupt(vec![ScheduledTask::Replication(Arc::clone(task))]);
        Ok(())
    }

    /// Queue a local retention pass.
    pub fn run_retention_now(&self) {
        self.ctx.interrupts.interrupt(vec![ScheduledTask::Retention]);
    }

    /// Run the scheduler loop until shutdown or, in run-once mode, until the
    /// single tick and its replication have finished.
    pub async fn run(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock().await;
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!("Replication engine running");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let tick = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => continue,
                tick = scheduler.next() => tick,
            };
            let Some(tick) = tick else {
                debug!("Run-once clock exhausted");
                break;
            };
            self.handle_tick(tick).await;
        }

        drop(scheduler);
        self.drain().await;

        // Nothing consumes the interrupt queue any more.
        if self.once && self.ctx.retention_requeued.swap(false, Ordering::SeqCst) {
            retention::run_local_retention(&self.ctx).await;
        }

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Replication engine stopped");
        Ok(())
    }

    /// Signal the scheduler loop to stop.
    ///
    /// `run()` returns once in-flight replication groups have drained. From
    /// `Created` the engine moves straight to `Stopped`.
    pub fn shutdown(&self) {
        info!("Shutting down replication engine");
        let _ = self.shutdown_tx.send(true);
        if self.state() == EngineState::Created {
            let _ = self.state_tx.send(EngineState::Stopped);
            metrics::set_engine_state("Stopped");
        }
    }

    async fn handle_tick(&self, tick: SchedulerTick) {
        let mut periodic = Vec::new();
        let mut replication = Vec::new();
        let mut retention_requested = false;
        for task in tick.tasks {
            match task {
                ScheduledTask::PeriodicSnapshot(task) => periodic.push(task),
                ScheduledTask::Replication(task) => replication.push(task),
                ScheduledTask::Retention => retention_requested = true,
            }
        }

        if !periodic.is_empty() {
            let succeeded = periodic::run_periodic_snapshot_tasks(&self.ctx, &tick.datetime, &periodic).await;
            for task in &self.ctx.replication_tasks {
                let triggered = task.auto
                    && task.schedule.is_none()
                    && task
                        .periodic_snapshot_tasks
                        .iter()
                        .any(|pst| succeeded.iter().any(|done| done.id == pst.id));
                if triggered && !replication.iter().any(|t: &Arc<ReplicationTask>| t.id == task.id) {
                    replication.push(Arc::clone(task));
                }
            }
        }

        if !replication.is_empty() {
            let handles = replication::spawn_replication_tasks(&self.ctx, replication);
            let mut group_handles = self.group_handles();
            group_handles.retain(|handle| !handle.is_finished());
            group_handles.extend(handles);
        }

        if !periodic.is_empty() || retention_requested {
            retention::run_local_retention(&self.ctx).await;
        }
    }

    fn group_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.group_handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait for background replication groups. Run-once mode waits for all of
    /// them; otherwise each gets [`DRAIN_TIMEOUT`].
    async fn drain(&self) {
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        let handles = std::mem::take(&mut *self.group_handles());
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for replication groups to finish");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let joined = if self.once {
                Ok(handle.await)
            } else {
                tokio::time::timeout(DRAIN_TIMEOUT, handle).await
            };
            match joined {
                Ok(Ok(())) => debug!(group = i + 1, "Replication group finished"),
                Ok(Err(e)) => error!(group = i + 1, error = %e, "Replication group panicked"),
                Err(_) => warn!(group = i + 1, "Replication group still running at shutdown"),
            }
        }

        if self.once && !self.ctx.running().is_empty() {
            warn!("Replication tasks still marked running after drain");
        }
    }
}
