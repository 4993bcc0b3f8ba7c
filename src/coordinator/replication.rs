//! Replication task execution.
//!
//! Due tasks are split into groups that must not run concurrently (same
//! transport host, or nesting target subtrees). Groups run in parallel as
//! background tasks bounded by the bulkhead; tasks within a group run one
//! after another.
//!
//! A single task run:
//! 1. resumes every interrupted receive in the target subtree, parents first
//! 2. plans each source dataset against its destination
//! 3. prunes the destination subtree of each part before a push (pre-retention)
//! 4. sends one snapshot per step, retrying recoverable failures
//! 5. applies the readonly policy and destination retention

use super::EngineContext;
use crate::config::{Direction, ReadonlyPolicy};
use crate::dataset::{self, Snapshot};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::observer::{self, ObserverEvent};
use crate::replication::plan::PLAN_PROPERTIES;
use crate::replication::{
    check_target, plan_transfer, pre_retention_snapshots, DatasetInfo, Destination, ReplicationStep, StuckMonitor,
    TransferPlan, TransferRunner,
};
use crate::resilience::{retry_partially_complete_state, retry_stuck_replication, RetryBudget};
use crate::retention::{calculate_snapshots_to_remove, ReplicationRetentionOwner, RetentionPolicy, SnapshotsByDataset};
use crate::schedule::ScheduledTask;
use crate::task::ReplicationTask;
use crate::transport::{
    destroy_snapshots, get_properties, DestroyFailureReason, ReplicationTransport, SnapshotStore, TransferOptions,
    TransferOutcome,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Grouping
// ═══════════════════════════════════════════════════════════════════════════════

fn targets_nest(a: &ReplicationTask, b: &ReplicationTask) -> bool {
    dataset::is_child(&a.target_dataset, &b.target_dataset) || dataset::is_child(&b.target_dataset, &a.target_dataset)
}

/// Split tasks into groups that may run concurrently with each other.
///
/// Within a group tasks are ordered by source datasets, recursive first.
pub(crate) fn group_tasks(tasks: Vec<Arc<ReplicationTask>>) -> Vec<Vec<Arc<ReplicationTask>>> {
    let mut groups: Vec<Vec<Arc<ReplicationTask>>> = Vec::new();

    for task in tasks {
        let transport_id = task.transport.id();
        let conflicting: Vec<usize> = groups
            .iter()
            .enumerate()
            .filter(|(_, group)| {
                group
                    .iter()
                    .any(|other| other.transport.id() == transport_id || targets_nest(other, &task))
            })
            .map(|(i, _)| i)
            .collect();

        let mut merged = vec![task];
        for i in conflicting.into_iter().rev() {
            merged.extend(groups.remove(i));
        }
        groups.push(merged);
    }

    for group in &mut groups {
        group.sort_by(|a, b| {
            a.source_datasets
                .cmp(&b.source_datasets)
                .then(b.recursive.cmp(&a.recursive))
                .then(a.id.cmp(&b.id))
        });
    }
    groups.sort_by(|a, b| a[0].id.cmp(&b[0].id));
    groups
}

/// Local datasets a running task touches.
fn local_datasets(task: &ReplicationTask) -> Vec<String> {
    match task.direction {
        Direction::Push => task.source_datasets.clone(),
        Direction::Pull => vec![task.target_dataset.clone()],
    }
}

/// Start `tasks` in the background. Tasks still running from an earlier
/// tick are skipped.
pub(crate) fn spawn_replication_tasks(ctx: &Arc<EngineContext>, tasks: Vec<Arc<ReplicationTask>>) -> Vec<JoinHandle<()>> {
    let tasks: Vec<Arc<ReplicationTask>> = {
        let mut running = ctx.running();
        tasks
            .into_iter()
            .filter(|task| {
                let started = running.start(&task.id, local_datasets(task));
                if !started {
                    warn!(task_id = %task.id, "Replication task is already running, skipping");
                }
                started
            })
            .collect()
    };

    group_tasks(tasks)
        .into_iter()
        .map(|group| {
            let ctx = Arc::clone(ctx);
            let ids: Vec<String> = group.iter().map(|t| t.id.clone()).collect();
            let span = info_span!("replication_group", tasks = ?ids);
            tokio::spawn(
                async move {
                    let _permit = match ctx.bulkhead.acquire().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            error!(error = %e, "Replication bulkhead closed");
                            let mut running = ctx.running();
                            for task in &group {
                                running.finish(&task.id);
                            }
                            return;
                        }
                    };

                    let active = ctx.running_groups.fetch_add(1, Ordering::SeqCst) + 1;
                    metrics::set_running_replication_groups(active);

                    for task in group {
                        run_replication_task(&ctx, task).await;
                    }

                    let active = ctx.running_groups.fetch_sub(1, Ordering::SeqCst) - 1;
                    metrics::set_running_replication_groups(active);
                }
                .instrument(span),
            )
        })
        .collect()
}

/// Run one task and report its outcome. Never fails.
pub(crate) async fn run_replication_task(ctx: &EngineContext, task: Arc<ReplicationTask>) {
    let started = Instant::now();
    info!(task_id = %task.id, "Starting replication task");
    observer::notify(
        ctx.observer.as_ref(),
        ObserverEvent::ReplicationTaskStart {
            task_id: task.id.clone(),
        },
    );

    let result = match ReplicationRun::new(ctx, &task) {
        Ok(run) => run.run().await,
        Err(e) => Err(e),
    };

    match result {
        Ok(warnings) => {
            info!(task_id = %task.id, warnings = warnings.len(), duration_ms = started.elapsed().as_millis() as u64, "Replication task finished");
            metrics::record_replication_task(&task.id, "success", started.elapsed());
            observer::notify(
                ctx.observer.as_ref(),
                ObserverEvent::ReplicationTaskSuccess {
                    task_id: task.id.clone(),
                    warnings,
                },
            );
        }
        Err(e) => {
            let outcome = if e.is_config_error() { "config_error" } else { "error" };
            error!(task_id = %task.id, error = %e, "Replication task failed");
            metrics::record_replication_task(&task.id, outcome, started.elapsed());
            observer::notify(
                ctx.observer.as_ref(),
                ObserverEvent::ReplicationTaskError {
                    task_id: task.id.clone(),
                    error: e.to_string(),
                },
            );
        }
    }

    if ctx.running().finish(&task.id) {
        debug!(task_id = %task.id, "Re-queueing deferred retention");
        ctx.retention_requeued.store(true, Ordering::SeqCst);
        ctx.interrupts.interrupt(vec![ScheduledTask::Retention]);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationRun
// ═══════════════════════════════════════════════════════════════════════════════

/// Preorder (parents first) comparison of dataset paths.
fn preorder(a: &String, b: &String) -> std::cmp::Ordering {
    a.split('/').cmp(b.split('/'))
}

struct ReplicationRun<'a> {
    ctx: &'a EngineContext,
    task: &'a Arc<ReplicationTask>,
    transport: Arc<dyn ReplicationTransport>,
    src_store: Arc<dyn SnapshotStore>,
    dst_store: Arc<dyn SnapshotStore>,
    warnings: Vec<String>,
    snapshots_sent: usize,
    snapshots_total: usize,
}

impl<'a> ReplicationRun<'a> {
    fn new(ctx: &'a EngineContext, task: &'a Arc<ReplicationTask>) -> Result<Self> {
        let transport = ctx.transports.create(&task.transport)?;
        let remote = transport.remote_store();
        let local = Arc::clone(&ctx.local_store);
        let (src_store, dst_store) = match task.direction {
            Direction::Push => (local, remote),
            Direction::Pull => (remote, local),
        };
        Ok(Self {
            ctx,
            task,
            transport,
            src_store,
            dst_store,
            warnings: Vec::new(),
            snapshots_sent: 0,
            snapshots_total: 0,
        })
    }

    fn runner(&self) -> TransferRunner<'_> {
        TransferRunner {
            task_id: &self.task.id,
            direction: self.task.direction,
            transport: self.transport.as_ref(),
            src_store: self.src_store.as_ref(),
            dst_store: self.dst_store.as_ref(),
            monitor: StuckMonitor::from_config(&self.ctx.settings.stuck_monitor),
            progress_interval: self.ctx.settings.progress_interval(),
            observer: self.ctx.observer.as_ref(),
        }
    }

    fn options(&self) -> TransferOptions {
        TransferOptions {
            properties: self.task.properties,
            replicate: self.task.replicate,
            exclude: self.task.exclude.clone(),
            speed_limit: self.task.speed_limit,
            encryption: self.task.encryption.clone(),
        }
    }

    async fn run(mut self) -> Result<Vec<String>> {
        self.resume_interrupted().await?;

        let src_datasets = self.list_source_datasets().await?;
        if src_datasets.is_empty() {
            warn!(task_id = %self.task.id, "No source datasets to replicate");
            return Ok(self.warnings);
        }

        let src_snapshots = self.list_source_snapshots().await?;
        let dst_datasets: HashSet<String> = self.list_target_datasets().await?.into_iter().collect();
        let dst_snapshots = self.list_target_snapshots().await?;

        let task = self.task;
        for root in &task.source_datasets {
            let part: Vec<&String> = if task.replicate {
                src_datasets.iter().filter(|ds| *ds == root).collect()
            } else {
                src_datasets.iter().filter(|ds| dataset::is_child(ds, root)).collect()
            };

            let mut plans = Vec::with_capacity(part.len());
            for src_dataset in part {
                let Some(dst_dataset) = self.task.target_dataset_for(src_dataset) else {
                    continue;
                };
                let destination = if dst_datasets.contains(&dst_dataset) {
                    let src_info = self.dataset_info(self.src_store.as_ref(), src_dataset).await?;
                    let dst_info = self.dataset_info(self.dst_store.as_ref(), &dst_dataset).await?;
                    check_target(self.task, src_dataset, &src_info, &dst_dataset, &dst_info)?;
                    Some(Destination {
                        info: dst_info,
                        snapshots: dst_snapshots.get(&dst_dataset).cloned().unwrap_or_default(),
                        resume_token: None,
                    })
                } else {
                    None
                };

                let names = src_snapshots.get(src_dataset).map(Vec::as_slice).unwrap_or(&[]);
                plans.push(plan_transfer(
                    self.task,
                    src_dataset,
                    names,
                    &dst_dataset,
                    destination.as_ref(),
                    self.ctx.settings.foreign_data_threshold_bytes,
                )?);
            }

            self.pre_retention(root, &src_snapshots, &dst_snapshots, &plans).await;

            self.snapshots_total += plans.iter().map(|p| p.snapshots.len()).sum::<usize>();
            for plan in plans {
                self.execute_plan(plan).await?;
            }
        }

        self.apply_readonly().await?;
        self.destination_retention().await;
        Ok(self.warnings)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Listing
    // ─────────────────────────────────────────────────────────────────────────

    async fn list_source_datasets(&self) -> Result<Vec<String>> {
        let mut datasets = Vec::new();
        for root in &self.task.source_datasets {
            let listed = self
                .ctx
                .command_timeout
                .run("list datasets", self.src_store.list_datasets(root, self.task.recursive))
                .await?;
            datasets.extend(listed.into_iter().filter(|ds| self.task.belongs(ds)));
        }
        datasets.sort_by(preorder);
        datasets.dedup();
        Ok(datasets)
    }

    async fn list_source_snapshots(&self) -> Result<SnapshotsByDataset> {
        let queries = self
            .task
            .source_datasets
            .iter()
            .map(|root| (root.clone(), self.task.recursive))
            .collect();
        self.ctx
            .command_timeout
            .run("list snapshots", self.src_store.multilist_snapshots(queries))
            .await
    }

    /// Target subtree, parents first. Empty if the target does not exist.
    async fn list_target_datasets(&self) -> Result<Vec<String>> {
        let listed = self
            .ctx
            .command_timeout
            .run("list datasets", self.dst_store.list_datasets(&self.task.target_dataset, true))
            .await;
        match listed {
            Ok(mut datasets) => {
                datasets.sort_by(preorder);
                Ok(datasets)
            }
            Err(ReplicationError::DatasetNotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_target_snapshots(&self) -> Result<SnapshotsByDataset> {
        self.ctx
            .command_timeout
            .run(
                "list snapshots",
                self.dst_store
                    .multilist_snapshots(vec![(self.task.target_dataset.clone(), true)]),
            )
            .await
    }

    async fn dataset_info(&self, store: &dyn SnapshotStore, dataset: &str) -> Result<DatasetInfo> {
        let properties = self
            .ctx
            .command_timeout
            .run("get properties", get_properties(store, dataset, PLAN_PROPERTIES))
            .await?;
        Ok(DatasetInfo::from_properties(&properties))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transfers
    // ─────────────────────────────────────────────────────────────────────────

    async fn resume_interrupted(&mut self) -> Result<()> {
        for dst_dataset in self.list_target_datasets().await? {
            let Some(src_dataset) = self.task.source_dataset_for(&dst_dataset) else {
                continue;
            };
            if !self.task.belongs(&src_dataset) {
                continue;
            }
            let token = self
                .ctx
                .command_timeout
                .run("get resume token", self.dst_store.get_resume_token(&dst_dataset))
                .await?;
            let Some(token) = token else {
                continue;
            };

            info!(task_id = %self.task.id, src = %src_dataset, dst = %dst_dataset, "Resuming interrupted transfer");
            let step = ReplicationStep {
                src_dataset,
                dst_dataset,
                snapshot: None,
                incremental_base: None,
                resume_token: Some(token),
            };
            let outcome = self.execute_step(&step).await?;
            self.collect_warnings(outcome);
        }
        Ok(())
    }

    async fn execute_plan(&mut self, plan: TransferPlan) -> Result<()> {
        if !plan.destroy_dst_snapshots.is_empty() {
            warn!(
                task_id = %self.task.id,
                dataset = %plan.dst_dataset,
                count = plan.destroy_dst_snapshots.len(),
                "No incremental base, destroying destination snapshots to replicate from scratch"
            );
            let snapshots: Vec<Snapshot> = plan
                .destroy_dst_snapshots
                .iter()
                .map(|name| Snapshot::new(plan.dst_dataset.clone(), name.clone()))
                .collect();
            let report = destroy_snapshots(self.dst_store.as_ref(), &snapshots, self.ctx.settings.destroy_arg_max).await;
            if let Some((snapshot, reason)) = report
                .failed
                .iter()
                .find(|(_, reason)| *reason != DestroyFailureReason::NotFound)
            {
                return Err(ReplicationError::command(
                    "destroy snapshots",
                    format!("unable to destroy {snapshot} before replicating from scratch: {reason:?}"),
                ));
            }
        }

        if plan.is_empty() {
            debug!(task_id = %self.task.id, dataset = %plan.src_dataset, "Nothing to replicate");
            return Ok(());
        }

        for step in plan.steps() {
            let snapshot = step.snapshot.clone().unwrap_or_default();
            observer::notify(
                self.ctx.observer.as_ref(),
                ObserverEvent::ReplicationTaskSnapshotStart {
                    task_id: self.task.id.clone(),
                    dataset: step.src_dataset.clone(),
                    snapshot: snapshot.clone(),
                    snapshots_sent: self.snapshots_sent,
                    snapshots_total: self.snapshots_total,
                },
            );

            let outcome = self.execute_step(&step).await?;
            self.collect_warnings(outcome);
            self.snapshots_sent += 1;

            observer::notify(
                self.ctx.observer.as_ref(),
                ObserverEvent::ReplicationTaskSnapshotSuccess {
                    task_id: self.task.id.clone(),
                    dataset: step.src_dataset.clone(),
                    snapshot,
                    snapshots_sent: self.snapshots_sent,
                    snapshots_total: self.snapshots_total,
                },
            );
        }
        Ok(())
    }

    /// Run one step, retrying recoverable failures within the task budget.
    ///
    /// A retry resumes the interrupted receive when the destination exposes
    /// a token, unless the previous attempt already was that resume.
    async fn execute_step(&self, step: &ReplicationStep) -> Result<TransferOutcome> {
        let retry_config = &self.ctx.settings.partial_state_retry;
        let runner = self.runner();
        let mut budget = RetryBudget::new(self.task.retries);
        let mut previous: Option<ReplicationError> = None;
        let mut resume_failed = false;

        loop {
            let attempt_step = match &previous {
                Some(_) if !resume_failed && !step.is_resume() => self.resume_step(step).await,
                _ => step.clone(),
            };
            let resuming = attempt_step.is_resume();

            let started = Instant::now();
            let options = self.options();
            let attempt = || runner.run(&attempt_step, options.clone());
            let result = match &previous {
                None => retry_partially_complete_state(retry_config, attempt).await,
                Some(e) => retry_stuck_replication(retry_config, Some(e), attempt).await,
            };
            metrics::record_transfer_step(&self.task.id, result.is_ok(), started.elapsed());

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    if !budget.record_failure(&e) {
                        return Err(e);
                    }
                    warn!(
                        task_id = %self.task.id,
                        step = %attempt_step,
                        attempt = budget.failures(),
                        retries = self.task.retries,
                        error = %e,
                        "Transfer failed, retrying"
                    );
                    metrics::record_transfer_retry(&self.task.id);
                    resume_failed = resuming;
                    previous = Some(e);
                }
            }
        }
    }

    /// `step` as a resume if the destination holds an interrupted receive.
    async fn resume_step(&self, step: &ReplicationStep) -> ReplicationStep {
        let lookup = self
            .ctx
            .command_timeout
            .run("get resume token", self.dst_store.get_resume_token(&step.dst_dataset))
            .await;
        match lookup {
            Ok(Some(token)) => ReplicationStep {
                src_dataset: step.src_dataset.clone(),
                dst_dataset: step.dst_dataset.clone(),
                snapshot: None,
                incremental_base: None,
                resume_token: Some(token),
            },
            Ok(None) => step.clone(),
            Err(e) => {
                debug!(dataset = %step.dst_dataset, error = %e, "Resume token lookup failed");
                step.clone()
            }
        }
    }

    fn collect_warnings(&mut self, outcome: TransferOutcome) {
        for warning in outcome.warnings {
            warn!(task_id = %self.task.id, warning = %warning, "Transfer warning");
            self.warnings.push(warning);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Destination housekeeping
    // ─────────────────────────────────────────────────────────────────────────

    async fn pre_retention(
        &self,
        root: &str,
        src: &SnapshotsByDataset,
        dst: &SnapshotsByDataset,
        plans: &[TransferPlan],
    ) {
        if self.task.direction != Direction::Push || matches!(self.task.retention_policy, RetentionPolicy::None) {
            return;
        }
        let bases: BTreeMap<String, String> = plans
            .iter()
            .filter_map(|plan| {
                plan.incremental_base
                    .as_ref()
                    .map(|base| (plan.dst_dataset.clone(), base.clone()))
            })
            .collect();

        let destroy = pre_retention_snapshots(self.ctx.now_local(), self.task, root, src, dst, &bases);
        if destroy.is_empty() {
            return;
        }
        info!(task_id = %self.task.id, count = destroy.len(), "Pruning destination before transfer");
        let started = Instant::now();
        let report = destroy_snapshots(self.dst_store.as_ref(), &destroy, self.ctx.settings.destroy_arg_max).await;
        metrics::record_retention_run("pre", report.destroyed.len(), report.failed.len(), started.elapsed());
    }

    async fn apply_readonly(&self) -> Result<()> {
        if self.task.readonly != ReadonlyPolicy::Set {
            return Ok(());
        }
        for root in &self.task.source_datasets {
            let Some(dst_dataset) = self.task.target_dataset_for(root) else {
                continue;
            };
            self.ctx
                .command_timeout
                .run("set property", self.dst_store.set_property(&dst_dataset, "readonly", "on"))
                .await?;
        }
        Ok(())
    }

    /// Prune the destination by the task's retention policy. Failures are
    /// logged, the task has already succeeded.
    async fn destination_retention(&self) {
        if matches!(self.task.retention_policy, RetentionPolicy::None) {
            return;
        }
        let listed = async { Ok::<_, ReplicationError>((self.list_source_snapshots().await?, self.list_target_snapshots().await?)) };
        let (src, dst) = match listed.await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(task_id = %self.task.id, error = %e, "Skipping destination retention");
                return;
            }
        };

        let owner = ReplicationRetentionOwner::new(self.ctx.now_local(), Arc::clone(self.task), &src, &dst);
        let destroy = calculate_snapshots_to_remove(&[&owner], &dst);
        let started = Instant::now();
        let report = destroy_snapshots(self.dst_store.as_ref(), &destroy, self.ctx.settings.destroy_arg_max).await;
        if !destroy.is_empty() {
            info!(task_id = %self.task.id, destroyed = report.destroyed.len(), failed = report.failed.len(), "Destination retention");
        }
        metrics::record_retention_run("remote", report.destroyed.len(), report.failed.len(), started.elapsed());
    }
}
