//! Local retention pass.

use super::EngineContext;
use crate::config::Direction;
use crate::dataset::Snapshot;
use crate::metrics;
use crate::retention::{
    calculate_snapshots_to_remove, PendingReplicationOwner, PeriodicTaskOwner, RemovalDateOwner,
    ReplicationRetentionOwner, SnapshotOwner, SnapshotsByDataset,
};
use crate::transport::destroy_snapshots;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Destroy expired local snapshots.
///
/// Snapshots under a running transfer are left alone and the pass is
/// re-queued once that transfer finishes.
#[instrument(skip_all, fields(periodic_tasks = ctx.periodic_tasks.len()))]
pub(crate) async fn run_local_retention(ctx: &EngineContext) {
    let started = Instant::now();
    let now = ctx.now_local();
    let store = ctx.local_store.as_ref();

    let mut queries: Vec<(String, bool)> = ctx
        .periodic_tasks
        .iter()
        .map(|task| (task.dataset.clone(), task.recursive))
        .collect();
    for task in &ctx.replication_tasks {
        match task.direction {
            Direction::Push => queries.extend(task.source_datasets.iter().map(|ds| (ds.clone(), task.recursive))),
            Direction::Pull => queries.push((task.target_dataset.clone(), true)),
        }
    }
    let removal_dates = ctx.removal_dates();
    queries.extend(
        removal_dates
            .keys()
            .filter_map(|key| key.split_once('@'))
            .map(|(dataset, _)| (dataset.to_string(), false)),
    );
    if queries.is_empty() {
        return;
    }

    let local = match ctx.command_timeout.run("list snapshots", store.multilist_snapshots(queries)).await {
        Ok(local) => local,
        Err(e) => {
            warn!(error = %e, "Skipping local retention, unable to list snapshots");
            return;
        }
    };

    let mut owners: Vec<Box<dyn SnapshotOwner>> = Vec::new();
    for task in &ctx.periodic_tasks {
        owners.push(Box::new(PeriodicTaskOwner::new(now, Arc::clone(task))));
    }
    for task in &ctx.replication_tasks {
        match task.direction {
            Direction::Push if task.hold_pending_snapshots => {
                let remote = list_remote(ctx, task.as_ref()).await.unwrap_or_default();
                owners.push(Box::new(PendingReplicationOwner::new(Arc::clone(task), local.clone(), remote)));
            }
            Direction::Push => {}
            Direction::Pull => match list_remote(ctx, task.as_ref()).await {
                Some(remote) => {
                    owners.push(Box::new(ReplicationRetentionOwner::new(now, Arc::clone(task), &remote, &local)));
                }
                None => {
                    warn!(task_id = %task.id, "Unable to list source snapshots, not pruning pulled snapshots");
                }
            },
        }
    }
    owners.push(Box::new(RemovalDateOwner::new(ctx.time_source.now(), removal_dates)));

    let owners: Vec<&dyn SnapshotOwner> = owners.iter().map(|o| o.as_ref()).collect();
    let candidates = calculate_snapshots_to_remove(&owners, &local);

    let (destroy, deferred): (Vec<Snapshot>, Vec<Snapshot>) = {
        let mut running = ctx.running();
        let split: (Vec<Snapshot>, Vec<Snapshot>) =
            candidates.into_iter().partition(|s| !running.is_busy(&s.dataset));
        if !split.1.is_empty() {
            running.defer_retention();
        }
        split
    };

    if !deferred.is_empty() {
        info!(count = deferred.len(), "Deferring retention of snapshots under a running transfer");
        metrics::record_retention_deferred(deferred.len());
    }
    if destroy.is_empty() {
        debug!("Local retention: nothing to destroy");
        return;
    }

    let report = destroy_snapshots(store, &destroy, ctx.settings.destroy_arg_max).await;
    info!(
        destroyed = report.destroyed.len(),
        failed = report.failed.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Local retention"
    );
    metrics::record_retention_run("local", report.destroyed.len(), report.failed.len(), started.elapsed());
}

/// Snapshots of the remote side of `task`. `None` if they cannot be listed.
async fn list_remote(ctx: &EngineContext, task: &crate::task::ReplicationTask) -> Option<SnapshotsByDataset> {
    let transport = match ctx.transports.create(&task.transport) {
        Ok(transport) => transport,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Unable to create transport for retention");
            return None;
        }
    };
    let store = transport.remote_store();
    let queries = match task.direction {
        Direction::Push => vec![(task.target_dataset.clone(), true)],
        Direction::Pull => task
            .source_datasets
            .iter()
            .map(|ds| (ds.clone(), task.recursive))
            .collect(),
    };
    match ctx.command_timeout.run("list snapshots", store.multilist_snapshots(queries)).await {
        Ok(snapshots) => Some(snapshots),
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Unable to list remote snapshots");
            None
        }
    }
}
