//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use chrono::{Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use proptest::prelude::*;
use snapshot_replication::config::{PeriodicSnapshotTaskDefinition, ReplicationTaskDefinition, ScheduleDefinition};
use snapshot_replication::replication::{plan_transfer, DatasetInfo, Destination};
use snapshot_replication::retention::{calculate_snapshots_to_remove, PeriodicTaskOwner, SnapshotOwner, SnapshotsByDataset};
use snapshot_replication::task::{PeriodicSnapshotTask, ReplicationTask};
use snapshot_replication::transport::chunk_destroy_names;
use snapshot_replication::{CronSchedule, NamingSchema};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const SCHEMA: &str = "auto-%Y-%m-%d_%H-%M";

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 4, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap()
}

/// Snapshot name for `epoch() + minutes`.
fn name_at(minutes: i64) -> String {
    (epoch() + Duration::minutes(minutes)).format("auto-%Y-%m-%d_%H-%M").to_string()
}

fn hourly_task() -> Arc<PeriodicSnapshotTask> {
    let mut def = PeriodicSnapshotTaskDefinition::for_testing("pool/data", SCHEMA);
    def.schedule = ScheduleDefinition {
        minute: "0".to_string(),
        ..ScheduleDefinition::default()
    };
    Arc::new(PeriodicSnapshotTask::from_definition("hourly", &def).unwrap())
}

fn replication_task() -> ReplicationTask {
    let periodic: BTreeMap<_, _> = [("hourly".to_string(), hourly_task())].into_iter().collect();
    let def = ReplicationTaskDefinition::for_testing("pool/data", "backup/data", &["hourly"]);
    ReplicationTask::from_definition("offsite", &def, &periodic).unwrap()
}

// =============================================================================
// Naming Schema Properties
// =============================================================================

proptest! {
    /// Formatting then parsing recovers the instant, offset included
    #[test]
    fn naming_round_trip(
        minutes in 0i64..(60 * 24 * 366 * 30),
        second in 0i64..60,
        offset_min in -840i32..=840,
    ) {
        let schema = NamingSchema::new("snap-%Y%m%d.%H%M%S%z").unwrap();
        let offset = FixedOffset::east_opt(offset_min * 60).unwrap();
        let local = epoch() + Duration::minutes(minutes) + Duration::seconds(second);
        let instant = offset.from_local_datetime(&local).single().unwrap();

        let name = schema.format(&instant);
        let parsed = schema.parse(&name);
        prop_assert!(parsed.is_some(), "{} did not parse", name);
        prop_assert_eq!(parsed.unwrap().parsed_datetime(), Some(instant));
    }

    /// Parsing arbitrary text never panics
    #[test]
    fn naming_parse_never_panics(name in "\\PC{0,40}") {
        let schema = NamingSchema::new(SCHEMA).unwrap();
        let _ = schema.parse(&name);
    }
}

// =============================================================================
// Transfer Planning Properties
// =============================================================================

proptest! {
    /// A plan only sends snapshots newer than its base, and the base is on the destination
    #[test]
    fn plan_sends_only_after_base(
        src in prop::collection::btree_set(0i64..2000, 1..30),
        keep in prop::collection::vec(any::<bool>(), 30),
    ) {
        let task = replication_task();
        let src_minutes: Vec<i64> = src.iter().copied().collect();
        let src_names: Vec<String> = src_minutes.iter().map(|m| name_at(*m * 60)).collect();
        let dst_names: Vec<String> = src_names
            .iter()
            .zip(&keep)
            .filter(|(_, keep)| **keep)
            .map(|(name, _)| name.clone())
            .collect();
        let dst = Destination {
            info: DatasetInfo::filesystem(),
            snapshots: dst_names.clone(),
            resume_token: None,
        };

        let plan = plan_transfer(&task, "pool/data", &src_names, "backup/data", Some(&dst), 1 << 20).unwrap();

        match &plan.incremental_base {
            None => {
                prop_assert!(dst_names.is_empty());
                prop_assert_eq!(&plan.snapshots, &src_names);
            }
            Some(base) => {
                prop_assert!(dst_names.contains(base));
                prop_assert_eq!(Some(base), dst_names.last());
                let position = src_names.iter().position(|n| n == base).unwrap();
                prop_assert_eq!(&plan.snapshots[..], &src_names[position + 1..]);
            }
        }
        prop_assert!(plan.destroy_dst_snapshots.is_empty());
    }
}

// =============================================================================
// Retention Properties
// =============================================================================

proptest! {
    /// Only claimed, expired snapshots are destroyed, and all of them are
    #[test]
    fn retention_destroys_exactly_expired(
        minutes in prop::collection::btree_set(0i64..(60 * 24 * 10), 0..40),
        foreign in prop::collection::vec("[a-z]{1,8}", 0..5),
    ) {
        let task = hourly_task();
        let now = epoch() + Duration::days(10);
        let owner = PeriodicTaskOwner::new(now, Arc::clone(&task));
        let owners: Vec<&dyn SnapshotOwner> = vec![&owner];

        let mut names: Vec<String> = minutes.iter().map(|m| name_at(*m)).collect();
        names.extend(foreign.iter().cloned());
        let snapshots: SnapshotsByDataset = [("pool/data".to_string(), names)].into_iter().collect();

        let destroyed: BTreeSet<String> = calculate_snapshots_to_remove(&owners, &snapshots)
            .into_iter()
            .map(|s| s.name)
            .collect();
        let expected: BTreeSet<String> = minutes
            .iter()
            .filter(|m| *m % 60 == 0)
            .filter(|m| epoch() + Duration::minutes(**m) < now - task.lifetime)
            .map(|m| name_at(*m))
            .collect();

        prop_assert_eq!(destroyed, expected);
    }
}

// =============================================================================
// Destroy Batching Properties
// =============================================================================

proptest! {
    /// Chunks preserve every name in order and respect the limit when possible
    #[test]
    fn destroy_chunks_cover_all_names(
        names in prop::collection::vec("[a-z0-9_-]{1,40}", 0..60),
        arg_max in 16usize..400,
    ) {
        let chunks = chunk_destroy_names("pool/data", &names, arg_max);
        let flattened: Vec<String> = chunks.iter().flatten().cloned().collect();
        prop_assert_eq!(&flattened, &names);

        for chunk in &chunks {
            prop_assert!(!chunk.is_empty());
            let length = "pool/data@".len() + chunk.join(",").len();
            prop_assert!(chunk.len() == 1 || length <= arg_max);
        }
    }
}

// =============================================================================
// Cron Schedule Properties
// =============================================================================

proptest! {
    /// Parsing arbitrary expressions never panics
    #[test]
    fn cron_parse_never_panics(expression in "[0-9*/,\\- a-z]{0,30}") {
        let _ = CronSchedule::parse(&expression);
    }

    /// The next occurrence is strictly later and matches
    #[test]
    fn cron_next_after_matches(
        minute in 0u32..60,
        hour in 0u32..24,
        offset in 0i64..(60 * 24 * 60),
    ) {
        let schedule = CronSchedule::parse(&format!("{minute} {hour} * * *")).unwrap();
        let from = epoch() + Duration::minutes(offset);
        let next = schedule.next_after(from).unwrap();

        prop_assert!(next > from);
        prop_assert!(schedule.matches(next));
        prop_assert!(next - from <= Duration::days(1));
    }
}
