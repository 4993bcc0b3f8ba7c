// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the Snapshot Replication Engine
//!
//! Every test drives a run-once engine through a single scheduler tick at
//! 2021-04-21 12:00 UTC against in-memory stores.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//! - `periodic_*` - snapshot creation
//! - `push_*` / `pull_*` - replication planning and transfer
//! - `retention_*` - local and destination retention

mod common;

use chrono::Duration as ChronoDuration;
use common::{noon, Harness, TransferFault};
use snapshot_replication::config::{
    Direction, PeriodicSnapshotTaskDefinition, ReadonlyPolicy, ReplicationTaskDefinition, RetentionPolicyKind,
    ScheduleDefinition, TransportDefinition,
};
use snapshot_replication::{EngineConfig, EngineState, ObserverEvent, ReplicationError};
use std::collections::HashMap;

const SCHEMA: &str = "auto-%Y-%m-%d_%H-%M";

/// Hourly snapshots of `pool/data`, pushed to `backup/data`.
fn push_config() -> EngineConfig {
    let mut config = EngineConfig::for_testing();
    let mut hourly = PeriodicSnapshotTaskDefinition::for_testing("pool/data", SCHEMA);
    hourly.schedule = ScheduleDefinition {
        minute: "0".to_string(),
        ..ScheduleDefinition::default()
    };
    config.periodic_snapshot_tasks.insert("hourly".to_string(), hourly);
    config.replication_tasks.insert(
        "offsite".to_string(),
        ReplicationTaskDefinition::for_testing("pool/data", "backup/data", &["hourly"]),
    );
    config
}

fn snapshot_only_config() -> EngineConfig {
    let mut config = push_config();
    config.replication_tasks.clear();
    config
}

// =============================================================================
// Periodic snapshots
// =============================================================================

#[tokio::test(start_paused = true)]
async fn periodic_snapshot_created_on_schedule() {
    let h = Harness::new();
    h.local.add_dataset("pool/data");

    let engine = h.engine(snapshot_only_config());
    engine.run().await.unwrap();

    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(h.local.snapshots("pool/data"), vec!["auto-2021-04-21_12-00"]);
    let events = h.observer.events();
    assert!(events.contains(&ObserverEvent::PeriodicSnapshotTaskStart {
        task_id: "hourly".to_string()
    }));
    assert!(events.contains(&ObserverEvent::PeriodicSnapshotTaskSuccess {
        task_id: "hourly".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn periodic_snapshot_not_due_off_schedule() {
    let h = Harness::new();
    h.local.add_dataset("pool/data");

    let engine = h.engine_at(snapshot_only_config(), noon() + ChronoDuration::minutes(30));
    engine.run().await.unwrap();

    assert!(h.local.created().is_empty());
    assert!(h.observer.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn periodic_recursive_snapshot_covers_child_task() {
    let h = Harness::new();
    h.local.add_dataset("pool");
    h.local.add_dataset("pool/data");

    let mut config = snapshot_only_config();
    let mut recursive = PeriodicSnapshotTaskDefinition::for_testing("pool", SCHEMA);
    recursive.recursive = true;
    config.periodic_snapshot_tasks.insert("everything".to_string(), recursive);

    let engine = h.engine(config);
    engine.run().await.unwrap();

    let created = h.local.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].dataset, "pool");
    assert_eq!(h.local.snapshots("pool/data"), vec!["auto-2021-04-21_12-00"]);
    assert!(h.observer.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn periodic_empty_snapshot_skipped() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.local.set_property("pool/data", "written", "0");

    let mut config = snapshot_only_config();
    if let Some(hourly) = config.periodic_snapshot_tasks.get_mut("hourly") {
        hourly.allow_empty = false;
    }

    let engine = h.engine(config);
    engine.run().await.unwrap();

    assert!(h.local.created().is_empty());
    assert_eq!(h.local.snapshots("pool/data"), vec!["auto-2021-04-21_11-00"]);
}

// =============================================================================
// Push replication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn push_full_send_to_new_target() {
    let h = Harness::new();
    h.local.add_dataset("pool/data");

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    assert_eq!(h.remote.snapshots("backup/data"), vec!["auto-2021-04-21_12-00"]);
    let steps = h.transports.steps();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].incremental_base, None);
    assert_eq!(steps[0].snapshot.as_deref(), Some("auto-2021-04-21_12-00"));
    assert!(h.observer.succeeded("offsite"));
}

#[tokio::test(start_paused = true)]
async fn push_incremental_from_newest_common_snapshot() {
    let h = Harness::new();
    h.local
        .add_snapshots("pool/data", &["auto-2021-04-21_10-00", "auto-2021-04-21_11-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-21_10-00"]);

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    let bases: Vec<_> = h
        .transports
        .steps()
        .into_iter()
        .map(|s| (s.snapshot.unwrap(), s.incremental_base.unwrap()))
        .collect();
    assert_eq!(
        bases,
        vec![
            ("auto-2021-04-21_11-00".to_string(), "auto-2021-04-21_10-00".to_string()),
            ("auto-2021-04-21_12-00".to_string(), "auto-2021-04-21_11-00".to_string()),
        ]
    );
    assert_eq!(
        h.remote.snapshots("backup/data"),
        vec!["auto-2021-04-21_10-00", "auto-2021-04-21_11-00", "auto-2021-04-21_12-00"]
    );

    let progress: Vec<(usize, usize)> = h
        .observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ObserverEvent::ReplicationTaskSnapshotSuccess {
                snapshots_sent,
                snapshots_total,
                ..
            } => Some((snapshots_sent, snapshots_total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 2), (2, 2)]);
}

#[tokio::test(start_paused = true)]
async fn push_without_common_snapshot_fails() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-20_09-00"]);

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    let errors = h.observer.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("No incremental base on dataset"), "{}", errors[0]);
    assert!(h.transports.calls().is_empty());
    assert_eq!(h.remote.snapshots("backup/data"), vec!["auto-2021-04-20_09-00"]);
}

#[tokio::test(start_paused = true)]
async fn push_from_scratch_replaces_destination() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-20_09-00"]);

    let mut config = push_config();
    if let Some(task) = config.replication_tasks.get_mut("offsite") {
        task.allow_from_scratch = true;
    }

    let engine = h.engine(config);
    engine.run().await.unwrap();

    assert!(h.observer.succeeded("offsite"));
    assert_eq!(h.remote.destroyed(), vec!["backup/data@auto-2021-04-20_09-00"]);
    assert_eq!(
        h.remote.snapshots("backup/data"),
        vec!["auto-2021-04-21_11-00", "auto-2021-04-21_12-00"]
    );
    assert_eq!(h.transports.steps()[0].incremental_base, None);
}

#[tokio::test(start_paused = true)]
async fn push_refuses_target_with_foreign_data() {
    let h = Harness::new();
    h.local.add_dataset("pool/data");
    h.remote.add_dataset("backup/data");
    h.remote.set_property("backup/data", "used", "1073741824");

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    let errors = h.observer.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Refusing to overwrite existing data"), "{}", errors[0]);
    assert!(h.remote.snapshots("backup/data").is_empty());
}

#[tokio::test(start_paused = true)]
async fn push_resumes_interrupted_receive_first() {
    let h = Harness::new();
    h.local
        .add_snapshots("pool/data", &["auto-2021-04-21_10-00", "auto-2021-04-21_11-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-21_10-00"]);
    h.remote.set_resume_token("backup/data", Some("1-abc"));
    h.transports.register_token("1-abc", "auto-2021-04-21_11-00");

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    let steps = h.transports.steps();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].resume_token.as_deref(), Some("1-abc"));
    assert_eq!(steps[1].incremental_base.as_deref(), Some("auto-2021-04-21_11-00"));
    assert_eq!(h.remote.resume_token("backup/data"), None);
    assert!(h.observer.succeeded("offsite"));
}

#[tokio::test(start_paused = true)]
async fn push_retry_resumes_after_interruption() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-21_11-00"]);
    h.transports.fail_next(TransferFault::Interrupt {
        token: "1-def".to_string(),
    });

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    let steps = h.transports.steps();
    assert_eq!(steps.len(), 2);
    assert!(!steps[0].is_resume());
    assert_eq!(steps[1].resume_token.as_deref(), Some("1-def"));
    assert_eq!(
        h.remote.snapshots("backup/data"),
        vec!["auto-2021-04-21_11-00", "auto-2021-04-21_12-00"]
    );
    assert!(h.observer.succeeded("offsite"));
}

#[tokio::test(start_paused = true)]
async fn push_readonly_set_after_success() {
    let h = Harness::new();
    h.local.add_dataset("pool/data");

    let mut config = push_config();
    if let Some(task) = config.replication_tasks.get_mut("offsite") {
        task.readonly = ReadonlyPolicy::Set;
    }

    let engine = h.engine(config);
    engine.run().await.unwrap();

    assert_eq!(h.remote.property("backup/data", "readonly").as_deref(), Some("on"));
}

#[tokio::test(start_paused = true)]
async fn push_readonly_required_on_existing_target() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-21_11-00"]);

    let mut config = push_config();
    if let Some(task) = config.replication_tasks.get_mut("offsite") {
        task.readonly = ReadonlyPolicy::Require;
    }

    let engine = h.engine(config);
    engine.run().await.unwrap();

    let errors = h.observer.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Readonly policy violation"), "{}", errors[0]);
}

#[tokio::test(start_paused = true)]
async fn push_queued_out_of_band() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);

    let engine = h.engine_at(push_config(), noon() + ChronoDuration::minutes(30));
    engine.run_replication_task_now("offsite").unwrap();
    engine.run().await.unwrap();

    assert!(h.local.created().is_empty());
    assert_eq!(h.remote.snapshots("backup/data"), vec!["auto-2021-04-21_11-00"]);
}

#[tokio::test(start_paused = true)]
async fn push_prunes_destination_before_transfer() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.remote
        .add_snapshots("backup/data", &["auto-2021-04-01_11-00", "auto-2021-04-21_11-00"]);
    h.transports
        .fail_next(TransferFault::Error(ReplicationError::transfer("backup/data", "broken pipe")));

    let mut config = push_config();
    if let Some(task) = config.replication_tasks.get_mut("offsite") {
        task.retention_policy = RetentionPolicyKind::Custom;
        task.lifetime = Some("7d".to_string());
        task.retries = 0;
    }

    let engine = h.engine(config);
    engine.run().await.unwrap();

    // The transfer failed, so only the pre-transfer pass can have pruned
    assert_eq!(h.observer.errors().len(), 1);
    assert_eq!(h.remote.destroyed(), vec!["backup/data@auto-2021-04-01_11-00"]);
}

// =============================================================================
// Pull replication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn pull_copies_remote_snapshots() {
    let h = Harness::new();
    h.remote
        .add_snapshots("tank/data", &["auto-2021-04-21_10-00", "auto-2021-04-21_11-00"]);

    let mut config = EngineConfig::for_testing();
    let mut pull = ReplicationTaskDefinition::for_testing("tank/data", "pool/backup", &[]);
    pull.direction = Direction::Pull;
    pull.transport = TransportDefinition {
        kind: "ssh".to_string(),
        hostname: Some("nas".to_string()),
        ..TransportDefinition::local()
    };
    pull.naming_schema = vec![SCHEMA.to_string()];
    pull.schedule = Some(ScheduleDefinition::default());
    config.replication_tasks.insert("fetch".to_string(), pull);

    let engine = h.engine(config);
    engine.run().await.unwrap();

    assert!(h.observer.succeeded("fetch"));
    assert_eq!(
        h.local.snapshots("pool/backup"),
        vec!["auto-2021-04-21_10-00", "auto-2021-04-21_11-00"]
    );
    assert!(h.transports.calls().iter().all(|c| c.direction == Direction::Pull));
}

#[tokio::test(start_paused = true)]
async fn pull_leaves_destination_alone_before_transfer() {
    let h = Harness::new();
    h.remote
        .add_snapshots("tank/data", &["auto-2021-04-21_10-00", "auto-2021-04-21_11-00"]);
    h.local
        .add_snapshots("pool/backup", &["auto-2021-04-01_10-00", "auto-2021-04-21_10-00"]);
    h.transports
        .fail_next(TransferFault::Error(ReplicationError::transfer("pool/backup", "broken pipe")));

    let mut config = EngineConfig::for_testing();
    let mut pull = ReplicationTaskDefinition::for_testing("tank/data", "pool/backup", &[]);
    pull.direction = Direction::Pull;
    pull.transport = TransportDefinition {
        kind: "ssh".to_string(),
        hostname: Some("nas".to_string()),
        ..TransportDefinition::local()
    };
    pull.naming_schema = vec![SCHEMA.to_string()];
    pull.schedule = Some(ScheduleDefinition::default());
    pull.retention_policy = RetentionPolicyKind::Custom;
    pull.lifetime = Some("7d".to_string());
    pull.retries = 0;
    config.replication_tasks.insert("fetch".to_string(), pull);

    let engine = h.engine(config);
    engine.run().await.unwrap();

    assert_eq!(h.observer.errors().len(), 1);
    assert_eq!(h.transports.steps().len(), 1);
    assert!(h.local.destroyed().is_empty());
}

// =============================================================================
// Retention
// =============================================================================

#[tokio::test(start_paused = true)]
async fn retention_destroys_expired_local_snapshots() {
    let h = Harness::new();
    h.local.add_snapshots(
        "pool/data",
        &["auto-2021-04-19_12-00", "auto-2021-04-21_11-00", "manual-keep"],
    );

    let engine = h.engine(snapshot_only_config());
    engine.run().await.unwrap();

    assert_eq!(h.local.destroyed(), vec!["pool/data@auto-2021-04-19_12-00"]);
    assert_eq!(
        h.local.snapshots("pool/data"),
        vec!["auto-2021-04-21_11-00", "manual-keep", "auto-2021-04-21_12-00"]
    );
}

#[tokio::test(start_paused = true)]
async fn retention_honours_removal_dates() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["manual-1", "manual-2"]);

    let engine = h.engine(EngineConfig::for_testing());
    engine.set_removal_dates(HashMap::from([
        ("pool/data@manual-1".to_string(), noon() - ChronoDuration::hours(1)),
        ("pool/data@manual-2".to_string(), noon() + ChronoDuration::hours(1)),
    ]));
    engine.run_retention_now();
    engine.run().await.unwrap();

    assert_eq!(h.local.destroyed(), vec!["pool/data@manual-1"]);
}

#[tokio::test(start_paused = true)]
async fn retention_holds_snapshots_pending_replication() {
    let h = Harness::new();
    h.local.add_snapshots(
        "pool/data",
        &["auto-2021-04-19_10-00", "auto-2021-04-19_11-00", "auto-2021-04-19_12-00"],
    );
    h.remote.add_snapshots("backup/data", &["auto-2021-04-19_10-00"]);
    h.remote.break_with("host unreachable");

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    assert_eq!(h.observer.errors().len(), 1);
    // Remote unreachable: nothing is known to be replicated, everything is held.
    assert!(h.local.destroyed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retention_deferred_until_transfer_finishes() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-19_12-00"]);
    h.remote.add_snapshots("backup/data", &["auto-2021-04-19_12-00"]);

    let engine = h.engine(push_config());
    engine.run().await.unwrap();

    assert!(h.observer.succeeded("offsite"));
    assert_eq!(h.local.destroyed(), vec!["pool/data@auto-2021-04-19_12-00"]);
    assert_eq!(h.local.snapshots("pool/data"), vec!["auto-2021-04-21_12-00"]);
}

#[tokio::test(start_paused = true)]
async fn retention_custom_policy_prunes_destination() {
    let h = Harness::new();
    h.local.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
    h.remote.add_snapshots(
        "backup/data",
        &["auto-2021-04-01_11-00", "auto-2021-04-20_11-00", "auto-2021-04-21_11-00"],
    );

    let mut config = push_config();
    if let Some(task) = config.replication_tasks.get_mut("offsite") {
        task.retention_policy = RetentionPolicyKind::Custom;
        task.lifetime = Some("7d".to_string());
    }

    let engine = h.engine(config);
    engine.run().await.unwrap();

    assert!(h.observer.succeeded("offsite"));
    assert_eq!(h.remote.destroyed(), vec!["backup/data@auto-2021-04-01_11-00"]);
    assert_eq!(
        h.remote.snapshots("backup/data"),
        vec!["auto-2021-04-20_11-00", "auto-2021-04-21_11-00", "auto-2021-04-21_12-00"]
    );
}
