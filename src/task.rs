//! Validated, immutable task definitions.
//!
//! Definitions from [`crate::config`] are turned into tasks once per
//! configuration load. Every structural invariant is checked here so that a
//! task that exists is a task that can run.
//!
//! Replication tasks hold their bound periodic snapshot tasks directly
//! (`Arc`), resolved by id at construction. Periodic tasks know nothing about
//! the replication tasks that reference them.

use crate::config::{
    parse_duration, Direction, EncryptionDefinition, EngineConfig, PeriodicSnapshotTaskDefinition,
    ReadonlyPolicy, ReplicationTaskDefinition, TransportDefinition,
};
use crate::dataset;
use crate::error::{ReplicationError, Result};
use crate::naming::{NamingSchema, ParsedSnapshotName, SnapshotNaming};
use crate::retention::RetentionPolicy;
use crate::schedule::CronSchedule;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Convert a config duration into the signed duration retention math uses.
pub(crate) fn to_chrono(duration: std::time::Duration, field: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| ReplicationError::Config(format!("{field} out of range: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeriodicSnapshotTask
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PeriodicSnapshotTask {
    pub id: String,
    pub dataset: String,
    pub recursive: bool,
    pub exclude: Vec<String>,
    pub lifetime: chrono::Duration,
    pub naming_schema: NamingSchema,
    pub schedule: CronSchedule,
    pub allow_empty: bool,
}

impl PeriodicSnapshotTask {
    pub fn from_definition(id: &str, def: &PeriodicSnapshotTaskDefinition) -> Result<Self> {
        let lifetime = to_chrono(parse_duration(&def.lifetime, "lifetime")?, "lifetime")?;
        Ok(Self {
            id: id.to_string(),
            dataset: def.dataset.clone(),
            recursive: def.recursive,
            exclude: def.exclude.clone(),
            lifetime,
            naming_schema: NamingSchema::new(def.naming_schema.clone())?,
            schedule: CronSchedule::from_definition(&def.schedule)?,
            allow_empty: def.allow_empty,
        })
    }

    /// `true` if `dataset` is in this task's scope.
    pub fn owns_dataset(&self, dataset: &str) -> bool {
        dataset::belongs_to_tree(dataset, &self.dataset, self.recursive, &self.exclude)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationTask
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ReplicationTask {
    pub id: String,
    pub direction: Direction,
    pub transport: TransportDefinition,
    pub source_datasets: Vec<String>,
    pub target_dataset: String,
    pub recursive: bool,
    pub exclude: Vec<String>,
    pub properties: bool,
    pub replicate: bool,
    pub periodic_snapshot_tasks: Vec<Arc<PeriodicSnapshotTask>>,
    /// Schema union (bound tasks, `naming-schema`, `also-include-naming-schema`)
    /// or a name pattern.
    pub naming: SnapshotNaming,
    pub auto: bool,
    pub schedule: Option<CronSchedule>,
    pub restrict_schedule: Option<CronSchedule>,
    pub only_matching_schedule: bool,
    pub allow_from_scratch: bool,
    pub hold_pending_snapshots: bool,
    pub retention_policy: RetentionPolicy,
    pub retries: u32,
    pub speed_limit: Option<u64>,
    pub readonly: ReadonlyPolicy,
    pub encryption: Option<EncryptionDefinition>,
}

impl ReplicationTask {
    pub fn from_definition(
        id: &str,
        def: &ReplicationTaskDefinition,
        periodic: &BTreeMap<String, Arc<PeriodicSnapshotTask>>,
    ) -> Result<Self> {
        let fail = |msg: String| Err(ReplicationError::Config(format!("Replication task '{id}': {msg}")));

        if def.source_dataset.is_empty() {
            return fail("source-dataset must not be empty".to_string());
        }
        if def.target_dataset.is_empty() {
            return fail("target-dataset must not be empty".to_string());
        }

        let mut bound = Vec::with_capacity(def.periodic_snapshot_tasks.len());
        for pst_id in &def.periodic_snapshot_tasks {
            match periodic.get(pst_id) {
                Some(task) => bound.push(Arc::clone(task)),
                None => return fail(format!("unknown periodic snapshot task '{pst_id}'")),
            }
        }

        match def.direction {
            Direction::Push => {
                if def.auto && def.schedule.is_none() && bound.is_empty() {
                    return fail(
                        "Push replication task with auto=true must be bound to a schedule or to periodic snapshot tasks"
                            .to_string(),
                    );
                }
                if bound.is_empty() && def.also_include_naming_schema.is_empty() && def.name_regex.is_none() {
                    return fail(
                        "You must at least provide either periodic-snapshot-tasks or also-include-naming-schema or name-regex for push replication task"
                            .to_string(),
                    );
                }
            }
            Direction::Pull => {
                if def.naming_schema.is_empty() && def.name_regex.is_none() {
                    return fail("You must provide naming-schema or name-regex for pull replication task".to_string());
                }
                if !bound.is_empty() {
                    return fail("Pull replication task can't have periodic-snapshot-tasks".to_string());
                }
            }
        }

        if def.restrict_schedule.is_some() && bound.is_empty() {
            return fail("restrict-schedule is only allowed for tasks bound to periodic snapshot tasks".to_string());
        }
        if def.only_matching_schedule && def.schedule.is_none() {
            return fail("only-matching-schedule requires a schedule".to_string());
        }

        if def.replicate {
            if !def.recursive {
                return fail("Replication tasks that replicate entire filesystem should be recursive".to_string());
            }
            if !def.exclude.is_empty() {
                return fail("Replication tasks that replicate entire filesystem can't exclude datasets".to_string());
            }
            if !def.properties {
                return fail("Replication tasks that replicate entire filesystem can't exclude properties".to_string());
            }
        }

        if def.recursive {
            for pst in &bound {
                for excluded in &pst.exclude {
                    let beneath_source = def.source_dataset.iter().any(|src| dataset::is_child(excluded, src));
                    if beneath_source && !def.exclude.contains(excluded) {
                        return fail(format!(
                            "Replication tasks should exclude everything their periodic snapshot tasks exclude \
                             (task does not exclude '{excluded}' from periodic snapshot task '{}')",
                            pst.id
                        ));
                    }
                }
            }
        }

        let naming = match &def.name_regex {
            Some(pattern) => {
                if !bound.is_empty() || !def.naming_schema.is_empty() || !def.also_include_naming_schema.is_empty() {
                    return fail("name-regex can't be used together with naming schemas or periodic snapshot tasks".to_string());
                }
                if def.restrict_schedule.is_some() || def.only_matching_schedule {
                    return fail("name-regex can't be used with restrict-schedule or only-matching-schedule".to_string());
                }
                if def.retention_policy == crate::config::RetentionPolicyKind::Custom {
                    return fail("name-regex can't be used with custom retention policy".to_string());
                }
                SnapshotNaming::pattern(pattern)?
            }
            None => {
                let mut schemas: Vec<NamingSchema> = bound.iter().map(|pst| pst.naming_schema.clone()).collect();
                for template in def.naming_schema.iter().chain(&def.also_include_naming_schema) {
                    schemas.push(NamingSchema::new(template.clone())?);
                }
                schemas.sort();
                schemas.dedup();
                SnapshotNaming::Schemas(schemas)
            }
        };

        let schedule = def.schedule.as_ref().map(CronSchedule::from_definition).transpose()?;
        let restrict_schedule = def.restrict_schedule.as_ref().map(CronSchedule::from_definition).transpose()?;

        Ok(Self {
            id: id.to_string(),
            direction: def.direction,
            transport: def.transport.clone(),
            source_datasets: def.source_dataset.clone(),
            target_dataset: def.target_dataset.clone(),
            recursive: def.recursive,
            exclude: def.exclude.clone(),
            properties: def.properties,
            replicate: def.replicate,
            periodic_snapshot_tasks: bound,
            naming,
            auto: def.auto,
            schedule,
            restrict_schedule,
            only_matching_schedule: def.only_matching_schedule,
            allow_from_scratch: def.allow_from_scratch,
            hold_pending_snapshots: def.hold_pending_snapshots,
            retention_policy: RetentionPolicy::from_definition(def)?,
            retries: def.retries,
            speed_limit: def.speed_limit,
            readonly: def.readonly,
            encryption: def.encryption.clone(),
        })
    }

    /// `true` if `dataset` is on the source side of this task.
    pub fn belongs(&self, dataset: &str) -> bool {
        self.source_datasets
            .iter()
            .any(|src| dataset::belongs_to_tree(dataset, src, self.recursive, &self.exclude))
    }

    pub fn target_dataset_for(&self, src_dataset: &str) -> Option<String> {
        dataset::target_dataset(&self.source_datasets, &self.target_dataset, src_dataset)
    }

    pub fn source_dataset_for(&self, dst_dataset: &str) -> Option<String> {
        dataset::source_dataset(&self.source_datasets, &self.target_dataset, dst_dataset)
    }

    /// Apply `restrict-schedule` and `only-matching-schedule`.
    ///
    /// Pattern-matched names carry no datetime and are never filtered.
    pub fn should_replicate(&self, parsed: &ParsedSnapshotName) -> bool {
        let Some(datetime) = parsed.datetime else {
            return true;
        };
        if let Some(restrict) = &self.restrict_schedule {
            if !restrict.should_run(datetime) {
                return false;
            }
        }
        if self.only_matching_schedule {
            if let Some(schedule) = &self.schedule {
                if !schedule.should_run(datetime) {
                    return false;
                }
            }
        }
        true
    }
}

/// Build every task from `config`, resolving bindings by id.
pub fn build_tasks(
    config: &EngineConfig,
) -> Result<(Vec<Arc<PeriodicSnapshotTask>>, Vec<Arc<ReplicationTask>>)> {
    let mut periodic = BTreeMap::new();
    for (id, def) in &config.periodic_snapshot_tasks {
        periodic.insert(id.clone(), Arc::new(PeriodicSnapshotTask::from_definition(id, def)?));
    }

    let mut replication = Vec::with_capacity(config.replication_tasks.len());
    for (id, def) in &config.replication_tasks {
        replication.push(Arc::new(ReplicationTask::from_definition(id, def, &periodic)?));
    }

    Ok((periodic.into_values().collect(), replication))
}
