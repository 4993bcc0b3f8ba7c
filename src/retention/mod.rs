//! Retention: which snapshots may be destroyed.
//!
//! Every rule is expressed as a [`SnapshotOwner`]. The calculator only
//! combines their votes:
//!
//! ```text
//! destroy(s) ⇔ ∃ owner claiming s  ∧  ∀ claiming owners: ¬should_retain(s)
//! ```
//!
//! Unclaimed snapshots are never returned, so unknown data is never touched.
//! A dataset whose names cannot be parsed unambiguously is skipped entirely.

pub mod owner;
pub mod policy;

pub use owner::{
    PendingReplicationOwner, PeriodicTaskOwner, RemovalDateOwner, ReplicationRetentionOwner, SnapshotOwner,
    SnapshotsByDataset,
};
pub use policy::RetentionPolicy;

use crate::dataset::Snapshot;

/// Snapshots to destroy, in dataset then listing order.
pub fn calculate_snapshots_to_remove(owners: &[&dyn SnapshotOwner], snapshots: &SnapshotsByDataset) -> Vec<Snapshot> {
    let mut result = Vec::new();

    for (dataset, names) in snapshots {
        let dataset_owners: Vec<&dyn SnapshotOwner> =
            owners.iter().copied().filter(|o| o.owns_dataset(dataset)).collect();
        if dataset_owners.is_empty() {
            continue;
        }

        let Some(parsed) = owner::parse_for_owners(dataset, names, &dataset_owners) else {
            continue;
        };

        for name in &parsed {
            let mut claimed = false;
            let mut retained = false;
            for o in &dataset_owners {
                if o.owns_snapshot(dataset, name) {
                    claimed = true;
                    if o.should_retain(dataset, name) {
                        retained = true;
                        break;
                    }
                }
            }
            if claimed && !retained {
                result.push(Snapshot::new(dataset.clone(), name.name.clone()));
            }
        }
    }

    result
}
