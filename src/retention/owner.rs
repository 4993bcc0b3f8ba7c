//! Snapshot owners: policies that claim snapshots and vote on keeping them.

use super::policy::RetentionPolicy;
use crate::naming::{parse_snapshot_names_with_multiple_schemas, NamingSchema, ParsedSnapshotName};
use crate::task::{PeriodicSnapshotTask, ReplicationTask};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Snapshot names per dataset.
pub type SnapshotsByDataset = BTreeMap<String, Vec<String>>;

/// Something that claims a subset of snapshots and votes on their retention.
///
/// A snapshot is deleted iff at least one owner claims it (`owns_dataset` and
/// `owns_snapshot`) and none of its claimants wants to retain it.
pub trait SnapshotOwner: Send + Sync {
    /// Schemas snapshot names are parsed with before being offered to this
    /// owner. `None` accepts raw names without a datetime.
    fn naming_schemas(&self) -> Vec<Option<NamingSchema>>;

    fn owns_dataset(&self, dataset: &str) -> bool;

    fn owns_snapshot(&self, dataset: &str, parsed: &ParsedSnapshotName) -> bool;

    fn should_retain(&self, dataset: &str, parsed: &ParsedSnapshotName) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeriodicTaskOwner
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshots a periodic task created, kept for the task's lifetime.
pub struct PeriodicTaskOwner {
    now: NaiveDateTime,
    task: Arc<PeriodicSnapshotTask>,
}

impl PeriodicTaskOwner {
    /// `now` is local wall time.
    pub fn new(now: NaiveDateTime, task: Arc<PeriodicSnapshotTask>) -> Self {
        Self { now, task }
    }
}

impl SnapshotOwner for PeriodicTaskOwner {
    fn naming_schemas(&self) -> Vec<Option<NamingSchema>> {
        vec![Some(self.task.naming_schema.clone())]
    }

    fn owns_dataset(&self, dataset: &str) -> bool {
        self.task.owns_dataset(dataset)
    }

    fn owns_snapshot(&self, _dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        parsed.naming_schema.as_ref() == Some(&self.task.naming_schema)
            && parsed
                .idealized_datetime()
                .is_some_and(|dt| self.task.schedule.should_run(dt))
    }

    fn should_retain(&self, _dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        let delete_before = self.now - self.task.lifetime;
        parsed.idealized_datetime().map_or(true, |dt| dt >= delete_before)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PendingReplicationOwner
// ═══════════════════════════════════════════════════════════════════════════════

/// Source snapshots a push task has not transferred yet.
///
/// A snapshot is pending if it is absent from the destination and later (in
/// the task's snapshot order) than the newest snapshot the destination
/// shares with the source. The incremental base itself is on the destination
/// and therefore never held by this owner.
pub struct PendingReplicationOwner {
    task: Arc<ReplicationTask>,
    src: SnapshotsByDataset,
    dst: SnapshotsByDataset,
}

impl PendingReplicationOwner {
    pub fn new(task: Arc<ReplicationTask>, src: SnapshotsByDataset, dst: SnapshotsByDataset) -> Self {
        Self { task, src, dst }
    }
}

impl SnapshotOwner for PendingReplicationOwner {
    fn naming_schemas(&self) -> Vec<Option<NamingSchema>> {
        self.task.naming.schemas()
    }

    fn owns_dataset(&self, dataset: &str) -> bool {
        self.task.belongs(dataset)
    }

    fn owns_snapshot(&self, _dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        self.task.naming.matches(parsed) && self.task.should_replicate(parsed)
    }

    fn should_retain(&self, dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        let Some(target) = self.task.target_dataset_for(dataset) else {
            return false;
        };
        let Some(dst_names) = self.dst.get(&target) else {
            // Target does not exist yet: everything is pending.
            return true;
        };
        if dst_names.contains(&parsed.name) {
            return false;
        }

        let src_names = self.src.get(dataset).map(Vec::as_slice).unwrap_or(&[]);
        let ordered = match self.task.naming.parse_ordered(src_names) {
            Ok(ordered) => ordered,
            Err(e) => {
                warn!(dataset, error = %e, "Failed to order source snapshots, holding");
                return true;
            }
        };
        let base = ordered.iter().rposition(|p| dst_names.contains(&p.name));
        let position = ordered.iter().position(|p| p.name == parsed.name);
        match (base, position) {
            (None, _) => true,
            (Some(base), Some(position)) => position > base,
            (Some(_), None) => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemovalDateOwner
// ═══════════════════════════════════════════════════════════════════════════════

/// Externally scheduled deletions keyed by `dataset@name`.
pub struct RemovalDateOwner {
    now: DateTime<Utc>,
    removal_dates: HashMap<String, DateTime<Utc>>,
}

impl RemovalDateOwner {
    pub fn new(now: DateTime<Utc>, removal_dates: HashMap<String, DateTime<Utc>>) -> Self {
        Self { now, removal_dates }
    }
}

impl SnapshotOwner for RemovalDateOwner {
    fn naming_schemas(&self) -> Vec<Option<NamingSchema>> {
        vec![None]
    }

    fn owns_dataset(&self, _dataset: &str) -> bool {
        true
    }

    fn owns_snapshot(&self, dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        self.removal_dates.contains_key(&format!("{dataset}@{}", parsed.name))
    }

    fn should_retain(&self, dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        self.removal_dates
            .get(&format!("{dataset}@{}", parsed.name))
            .map_or(true, |date| *date > self.now)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationRetentionOwner
// ═══════════════════════════════════════════════════════════════════════════════

/// Destination snapshots governed by a replication task's retention policy.
///
/// The newest snapshot shared with the source is always kept, since the next
/// incremental transfer starts from it.
pub struct ReplicationRetentionOwner {
    task: Arc<ReplicationTask>,
    delete: HashMap<String, HashSet<String>>,
}

impl ReplicationRetentionOwner {
    /// `src` is keyed by source dataset, `dst` by destination dataset.
    pub fn new(now: NaiveDateTime, task: Arc<ReplicationTask>, src: &SnapshotsByDataset, dst: &SnapshotsByDataset) -> Self {
        let mut delete = HashMap::new();
        for (dst_dataset, dst_names) in dst {
            let Some(src_dataset) = task.source_dataset_for(dst_dataset) else {
                continue;
            };
            if !task.belongs(&src_dataset) {
                continue;
            }
            let src_names = src.get(&src_dataset).map(Vec::as_slice).unwrap_or(&[]);
            match retention_for_dataset(now, &task, &task.retention_policy, src_names, dst_names) {
                Ok(names) => {
                    delete.insert(dst_dataset.clone(), names);
                }
                Err(e) => {
                    warn!(dataset = %dst_dataset, error = %e, "Skipping destination retention for dataset");
                }
            }
        }
        Self { task, delete }
    }
}

fn retention_for_dataset(
    now: NaiveDateTime,
    task: &ReplicationTask,
    policy: &RetentionPolicy,
    src_names: &[String],
    dst_names: &[String],
) -> crate::error::Result<HashSet<String>> {
    let src_parsed = task.naming.parse_ordered(src_names)?;
    let dst_parsed = task.naming.parse_ordered(dst_names)?;

    let latest_common = src_parsed
        .iter()
        .rev()
        .find(|p| dst_parsed.iter().any(|d| d.name == p.name))
        .map(|p| p.name.clone());

    Ok(policy
        .calculate_delete_snapshots(now, &src_parsed, &dst_parsed)
        .into_iter()
        .map(|p| p.name)
        .filter(|name| Some(name) != latest_common.as_ref())
        .collect())
}

impl SnapshotOwner for ReplicationRetentionOwner {
    fn naming_schemas(&self) -> Vec<Option<NamingSchema>> {
        self.task.naming.schemas()
    }

    fn owns_dataset(&self, dataset: &str) -> bool {
        self.delete.contains_key(dataset)
    }

    fn owns_snapshot(&self, _dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        self.task.naming.matches(parsed)
    }

    fn should_retain(&self, dataset: &str, parsed: &ParsedSnapshotName) -> bool {
        !self
            .delete
            .get(dataset)
            .is_some_and(|names| names.contains(&parsed.name))
    }
}

/// Parse one dataset's names for a set of owners, warning on failure.
pub(crate) fn parse_for_owners(
    dataset: &str,
    names: &[String],
    owners: &[&dyn SnapshotOwner],
) -> Option<Vec<ParsedSnapshotName>> {
    let schemas: Vec<Option<NamingSchema>> = owners.iter().flat_map(|o| o.naming_schemas()).collect();
    match parse_snapshot_names_with_multiple_schemas(names, &schemas) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(dataset, error = %e, "Failed to parse snapshot names, skipping dataset");
            None
        }
    }
}
