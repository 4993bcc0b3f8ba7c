//! Tick loop emitting the tasks due at each minute.

use super::clock::{Clock, ClockTick};
use super::tz_clock::{TzClock, TzClockDateTime};
use crate::task::{PeriodicSnapshotTask, ReplicationTask};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A unit of work the engine runs on a tick.
#[derive(Clone)]
pub enum ScheduledTask {
    PeriodicSnapshot(Arc<PeriodicSnapshotTask>),
    Replication(Arc<ReplicationTask>),
    /// Local retention pass, only ever injected through an interrupt.
    Retention,
}

impl ScheduledTask {
    pub fn id(&self) -> &str {
        match self {
            ScheduledTask::PeriodicSnapshot(task) => &task.id,
            ScheduledTask::Replication(task) => &task.id,
            ScheduledTask::Retention => "retention",
        }
    }

    fn is_due(&self, tick: &TzClockDateTime) -> bool {
        match self {
            ScheduledTask::PeriodicSnapshot(task) => task.schedule.should_run(tick.datetime),
            ScheduledTask::Replication(task) => {
                task.auto
                    && task
                        .schedule
                        .as_ref()
                        .is_some_and(|schedule| schedule.should_run(tick.datetime))
            }
            ScheduledTask::Retention => false,
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduledTask::PeriodicSnapshot(task) => write!(f, "PeriodicSnapshot({})", task.id),
            ScheduledTask::Replication(task) => write!(f, "Replication({})", task.id),
            ScheduledTask::Retention => f.write_str("Retention"),
        }
    }
}

/// Tasks due at one tick.
#[derive(Debug, Clone)]
pub struct SchedulerTick {
    pub datetime: TzClockDateTime,
    pub tasks: Vec<ScheduledTask>,
}

/// Injects ad-hoc task batches into the next tick.
#[derive(Clone)]
pub struct InterruptHandle {
    queue: Arc<Mutex<VecDeque<Vec<ScheduledTask>>>>,
    notify: Arc<Notify>,
}

impl InterruptHandle {
    /// Queue `tasks` and wake the scheduler.
    pub fn interrupt(&self, tasks: Vec<ScheduledTask>) {
        debug!(tasks = ?tasks, "Scheduler interrupt");
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(tasks),
            Err(poisoned) => poisoned.into_inner().push_back(tasks),
        }
        self.notify.notify_one();
    }

    fn drain(&self) -> Vec<ScheduledTask> {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).flatten().collect()
    }
}

pub struct Scheduler {
    clock: Clock,
    tz_clock: TzClock,
    tasks: Vec<ScheduledTask>,
    interrupts: InterruptHandle,
}

impl Scheduler {
    pub fn new(clock: Clock, tz_clock: TzClock) -> Self {
        let interrupts = InterruptHandle {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: clock.interrupt_handle(),
        };
        Self {
            clock,
            tz_clock,
            tasks: Vec::new(),
            interrupts,
        }
    }

    /// Replace the registered task set.
    pub fn set_tasks(&mut self, tasks: Vec<ScheduledTask>) {
        self.tasks = tasks;
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupts.clone()
    }

    /// Wait for the next tick with work on it.
    ///
    /// Interrupt ticks carry only the queued tasks. Regular ticks carry the
    /// due registered tasks followed by anything queued since the last tick.
    /// Returns `None` when a run-once clock is exhausted.
    pub async fn next(&mut self) -> Option<SchedulerTick> {
        loop {
            let ClockTick { datetime, interrupted } = self.clock.tick().await?;
            let local = self.tz_clock.tick(datetime);

            if let Some(step_back) = local.legit_step_back {
                warn!(step_back_sec = step_back.num_seconds(), local = %local.datetime, "Local time moved backwards (DST transition)");
            }

            let mut tasks: Vec<ScheduledTask> = if interrupted {
                Vec::new()
            } else {
                self.tasks.iter().filter(|t| t.is_due(&local)).cloned().collect()
            };
            tasks.extend(self.interrupts.drain());

            if interrupted && tasks.is_empty() {
                continue;
            }

            debug!(local = %local.datetime, interrupted, tasks = ?tasks, "Scheduler tick");
            return Some(SchedulerTick { datetime: local, tasks });
        }
    }
}
