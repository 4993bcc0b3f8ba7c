//! Destination retention applied right before a transfer.
//!
//! Pruning the destination first keeps it from briefly holding both the
//! expired snapshots and the new ones. Only the subtree the upcoming transfer
//! writes to is considered, and the incremental base is never touched.

use crate::dataset::{self, Snapshot};
use crate::retention::{calculate_snapshots_to_remove, ReplicationRetentionOwner, SnapshotsByDataset};
use crate::task::ReplicationTask;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Destination snapshots to destroy before transferring the source subtree
/// rooted at `src_root`.
///
/// `src` is keyed by source dataset, `dst` by destination dataset.
/// `incremental_bases` maps destination datasets to the snapshot the next
/// send starts from.
pub fn pre_retention_snapshots(
    now: NaiveDateTime,
    task: &Arc<ReplicationTask>,
    src_root: &str,
    src: &SnapshotsByDataset,
    dst: &SnapshotsByDataset,
    incremental_bases: &BTreeMap<String, String>,
) -> Vec<Snapshot> {
    let Some(dst_root) = task.target_dataset_for(src_root) else {
        return Vec::new();
    };

    let subtree: SnapshotsByDataset = dst
        .iter()
        .filter(|(dst_dataset, _)| dataset::is_child(dst_dataset, &dst_root))
        .map(|(dst_dataset, names)| (dst_dataset.clone(), names.clone()))
        .collect();
    if subtree.is_empty() {
        return Vec::new();
    }

    let owner = ReplicationRetentionOwner::new(now, Arc::clone(task), src, &subtree);
    calculate_snapshots_to_remove(&[&owner], &subtree)
        .into_iter()
        .filter(|snapshot| incremental_bases.get(&snapshot.dataset) != Some(&snapshot.name))
        .collect()
}
