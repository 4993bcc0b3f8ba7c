//! Periodic snapshot creation for one scheduler tick.
//!
//! Tasks are processed in a fixed order (snapshot name, recursive first,
//! no-excludes first) and every snapshot created during the tick is
//! remembered, so a later task whose snapshot was already covered by an
//! earlier recursive one is skipped instead of failing.

use super::EngineContext;
use crate::dataset;
use crate::error::Result;
use crate::metrics;
use crate::observer::{self, ObserverEvent};
use crate::schedule::TzClockDateTime;
use crate::task::PeriodicSnapshotTask;
use crate::transport::{get_properties, CreateSnapshot, PropertyKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Pair every task with its snapshot name for this tick, in creation order.
pub(crate) fn creation_order(
    tasks: &[Arc<PeriodicSnapshotTask>],
    tick: &TzClockDateTime,
) -> Vec<(Arc<PeriodicSnapshotTask>, String)> {
    let mut ordered: Vec<_> = tasks
        .iter()
        .map(|task| (Arc::clone(task), task.naming_schema.format(&tick.offset_aware)))
        .collect();
    ordered.sort_by(|(a, a_name), (b, b_name)| {
        a_name
            .cmp(b_name)
            .then(b.recursive.cmp(&a.recursive))
            .then(a.exclude.is_empty().cmp(&b.exclude.is_empty()).reverse())
            .then(a.dataset.cmp(&b.dataset))
    });
    ordered
}

/// Snapshots created so far in this tick.
#[derive(Debug, Default)]
pub(crate) struct CreatedThisTick {
    created: Vec<(String, String, bool, Vec<String>)>,
}

impl CreatedThisTick {
    pub fn record(&mut self, task: &PeriodicSnapshotTask, name: &str) {
        self.created
            .push((task.dataset.clone(), name.to_string(), task.recursive, task.exclude.clone()));
    }

    /// `true` if `name` on `task.dataset` already exists thanks to an
    /// earlier task in this tick.
    pub fn covers(&self, task: &PeriodicSnapshotTask, name: &str) -> bool {
        self.created.iter().any(|(ds, created_name, recursive, exclude)| {
            created_name == name
                && (*ds == task.dataset
                    || (*recursive && dataset::belongs_to_tree(&task.dataset, ds, true, exclude)))
        })
    }
}

enum Outcome {
    Created,
    Skipped(&'static str),
}

/// Create this tick's periodic snapshots.
///
/// Failures are reported per task and never abort the tick. Returns the
/// tasks that did not fail, so replication bound to them can follow.
#[instrument(skip_all, fields(tick = %tick.datetime, tasks = tasks.len()))]
pub(crate) async fn run_periodic_snapshot_tasks(
    ctx: &EngineContext,
    tick: &TzClockDateTime,
    tasks: &[Arc<PeriodicSnapshotTask>],
) -> Vec<Arc<PeriodicSnapshotTask>> {
    let mut created = CreatedThisTick::default();
    let mut succeeded = Vec::with_capacity(tasks.len());

    for (task, name) in creation_order(tasks, tick) {
        observer::notify(
            ctx.observer.as_ref(),
            ObserverEvent::PeriodicSnapshotTaskStart {
                task_id: task.id.clone(),
            },
        );

        match create_snapshot(ctx, tick, &task, &name, &created).await {
            Ok(outcome) => {
                match outcome {
                    Outcome::Created => {
                        info!(task_id = %task.id, dataset = %task.dataset, snapshot = %name, "Created snapshot");
                        metrics::record_snapshot_created(&task.id);
                        created.record(&task, &name);
                    }
                    Outcome::Skipped(reason) => {
                        debug!(task_id = %task.id, snapshot = %name, reason, "Skipped snapshot");
                        metrics::record_snapshot_skipped(&task.id, reason);
                    }
                }
                observer::notify(
                    ctx.observer.as_ref(),
                    ObserverEvent::PeriodicSnapshotTaskSuccess {
                        task_id: task.id.clone(),
                    },
                );
                succeeded.push(task);
            }
            Err(e) => {
                error!(task_id = %task.id, dataset = %task.dataset, snapshot = %name, error = %e, "Failed to create snapshot");
                metrics::record_snapshot_error(&task.id);
                observer::notify(
                    ctx.observer.as_ref(),
                    ObserverEvent::PeriodicSnapshotTaskError {
                        task_id: task.id.clone(),
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    succeeded
}

async fn create_snapshot(
    ctx: &EngineContext,
    tick: &TzClockDateTime,
    task: &PeriodicSnapshotTask,
    name: &str,
    created: &CreatedThisTick,
) -> Result<Outcome> {
    if created.covers(task, name) {
        return Ok(Outcome::Skipped("already_created"));
    }

    if tick.legit_step_back.is_some() && !task.naming_schema.has_offset() {
        let existing = ctx
            .command_timeout
            .run("list snapshots", ctx.local_store.list_snapshots(&task.dataset, false))
            .await?;
        if existing.iter().any(|s| s.name == name) {
            warn!(
                task_id = %task.id,
                snapshot = %name,
                "Snapshot already exists for repeated local hour, use %z in the naming schema to keep both"
            );
            return Ok(Outcome::Skipped("dst_repeat"));
        }
    }

    if !task.allow_empty && is_empty_snapshot(ctx, task).await? {
        return Ok(Outcome::Skipped("empty"));
    }

    let request = CreateSnapshot {
        dataset: task.dataset.clone(),
        name: name.to_string(),
        recursive: task.recursive,
        exclude: task.exclude.clone(),
        properties: BTreeMap::new(),
    };
    ctx.command_timeout
        .run("create snapshot", ctx.local_store.create_snapshot(request))
        .await?;
    Ok(Outcome::Created)
}

/// `true` if nothing was written in any dataset in scope since its last
/// snapshot.
async fn is_empty_snapshot(ctx: &EngineContext, task: &PeriodicSnapshotTask) -> Result<bool> {
    let store = ctx.local_store.as_ref();
    let datasets = ctx
        .command_timeout
        .run("list datasets", store.list_datasets(&task.dataset, task.recursive))
        .await?;
    let snapshots = ctx
        .command_timeout
        .run(
            "list snapshots",
            store.multilist_snapshots(vec![(task.dataset.clone(), task.recursive)]),
        )
        .await?;

    for dataset in datasets.iter().filter(|d| task.owns_dataset(d)) {
        if !snapshots.get(dataset).is_some_and(|names| !names.is_empty()) {
            return Ok(false);
        }
        let properties = ctx
            .command_timeout
            .run("get properties", get_properties(store, dataset, &[("written", PropertyKind::Bytes)]))
            .await?;
        if properties.get("written").and_then(|v| v.as_bytes()) != Some(0) {
            return Ok(false);
        }
    }
    Ok(true)
}
