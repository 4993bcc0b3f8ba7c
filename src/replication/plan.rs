//! Incremental-base selection and per-dataset transfer plans.
//!
//! Planning is pure: the caller gathers snapshot listings and dataset
//! properties for both sides, and gets back either a plan or a configuration
//! error explaining why the destination must not be touched.

use crate::config::ReadonlyPolicy;
use crate::error::{ReplicationError, Result};
use crate::task::ReplicationTask;
use crate::transport::{PropertyKind, PropertyValue};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// One transfer primitive invocation: a single snapshot (or a resume).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStep {
    pub src_dataset: String,
    pub dst_dataset: String,
    /// Snapshot to send; `None` when resuming.
    pub snapshot: Option<String>,
    /// `None` for a full send.
    pub incremental_base: Option<String>,
    pub resume_token: Option<String>,
}

impl ReplicationStep {
    pub fn is_resume(&self) -> bool {
        self.resume_token.is_some()
    }
}

impl fmt::Display for ReplicationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.resume_token, &self.snapshot, &self.incremental_base) {
            (Some(_), _, _) => write!(f, "resume {} -> {}", self.src_dataset, self.dst_dataset),
            (None, Some(snapshot), Some(base)) => {
                write!(f, "{}@{} -> {} (from {})", self.src_dataset, snapshot, self.dst_dataset, base)
            }
            (None, Some(snapshot), None) => write!(f, "{}@{} -> {} (full)", self.src_dataset, snapshot, self.dst_dataset),
            (None, None, _) => write!(f, "{} -> {}", self.src_dataset, self.dst_dataset),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dataset properties relevant to planning
// ═══════════════════════════════════════════════════════════════════════════════

/// Properties requested from both sides before planning.
pub const PLAN_PROPERTIES: &[(&str, PropertyKind)] = &[
    ("type", PropertyKind::Str),
    ("encryption", PropertyKind::Str),
    ("readonly", PropertyKind::Bool),
    ("used", PropertyKind::Bytes),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    /// `filesystem` or `volume`.
    pub kind: String,
    pub encrypted: bool,
    pub readonly: bool,
    pub used: u64,
}

impl DatasetInfo {
    pub fn from_properties(properties: &BTreeMap<String, PropertyValue>) -> Self {
        let kind = properties
            .get("type")
            .and_then(PropertyValue::as_str)
            .unwrap_or("filesystem")
            .to_string();
        let encrypted = properties
            .get("encryption")
            .and_then(PropertyValue::as_str)
            .is_some_and(|e| e != "off");
        Self {
            kind,
            encrypted,
            readonly: properties.get("readonly").and_then(PropertyValue::as_bool).unwrap_or(false),
            used: properties.get("used").and_then(PropertyValue::as_bytes).unwrap_or(0),
        }
    }

    pub fn filesystem() -> Self {
        Self {
            kind: "filesystem".to_string(),
            encrypted: false,
            readonly: false,
            used: 0,
        }
    }
}

/// What exists at the destination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub info: DatasetInfo,
    pub snapshots: Vec<String>,
    pub resume_token: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TransferPlan
// ═══════════════════════════════════════════════════════════════════════════════

/// What to do for one source dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub src_dataset: String,
    pub dst_dataset: String,
    /// Newest snapshot both sides have.
    pub incremental_base: Option<String>,
    /// Interrupted receive to continue before anything else.
    pub resume_token: Option<String>,
    /// Destination snapshots to destroy before a from-scratch send.
    pub destroy_dst_snapshots: Vec<String>,
    /// Snapshots to send, oldest first.
    pub snapshots: Vec<String>,
}

impl TransferPlan {
    pub fn is_empty(&self) -> bool {
        self.resume_token.is_none() && self.snapshots.is_empty()
    }

    /// One step per snapshot, each incremental from the previous one.
    /// A pending resume is the only step; the caller re-plans afterwards.
    pub fn steps(&self) -> Vec<ReplicationStep> {
        if let Some(token) = &self.resume_token {
            return vec![ReplicationStep {
                src_dataset: self.src_dataset.clone(),
                dst_dataset: self.dst_dataset.clone(),
                snapshot: None,
                incremental_base: None,
                resume_token: Some(token.clone()),
            }];
        }

        let mut base = self.incremental_base.clone();
        self.snapshots
            .iter()
            .map(|snapshot| {
                let step = ReplicationStep {
                    src_dataset: self.src_dataset.clone(),
                    dst_dataset: self.dst_dataset.clone(),
                    snapshot: Some(snapshot.clone()),
                    incremental_base: base.clone(),
                    resume_token: None,
                };
                base = Some(snapshot.clone());
                step
            })
            .collect()
    }
}

/// Refuse destinations the task must not write to.
pub fn check_target(task: &ReplicationTask, src_dataset: &str, src: &DatasetInfo, dst_dataset: &str, dst: &DatasetInfo) -> Result<()> {
    if src.kind != dst.kind {
        return Err(ReplicationError::TargetTypeMismatch {
            src: src_dataset.to_string(),
            src_type: src.kind.clone(),
            dst: dst_dataset.to_string(),
            dst_type: dst.kind.clone(),
        });
    }

    if task.encryption.is_some() && !dst.encrypted {
        return Err(ReplicationError::EncryptionMismatch(format!(
            "Encryption requested for destination dataset '{dst_dataset}', but it already exists and is not encrypted."
        )));
    }

    if src.encrypted && task.properties && !dst.encrypted {
        return Err(ReplicationError::EncryptionMismatch(format!(
            "Source dataset '{src_dataset}' is encrypted and is sent raw, but destination dataset '{dst_dataset}' already exists and is not encrypted."
        )));
    }

    if task.readonly == ReadonlyPolicy::Require && !dst.readonly {
        return Err(ReplicationError::ReadonlyViolation(format!(
            "Target dataset '{dst_dataset}' exists and does not have readonly=on property, but replication task is set up to require this property. Refusing to replicate."
        )));
    }

    Ok(())
}

/// Plan the transfer of one source dataset.
///
/// `src_snapshots` and the destination listing are in creation order.
/// `dst` is `None` when the destination dataset does not exist.
pub fn plan_transfer(
    task: &ReplicationTask,
    src_dataset: &str,
    src_snapshots: &[String],
    dst_dataset: &str,
    dst: Option<&Destination>,
    foreign_data_threshold: u64,
) -> Result<TransferPlan> {
    let mut plan = TransferPlan {
        src_dataset: src_dataset.to_string(),
        dst_dataset: dst_dataset.to_string(),
        incremental_base: None,
        resume_token: None,
        destroy_dst_snapshots: Vec::new(),
        snapshots: Vec::new(),
    };

    if let Some(token) = dst.and_then(|d| d.resume_token.clone()) {
        plan.resume_token = Some(token);
        return Ok(plan);
    }

    let src_parsed = task.naming.parse_ordered(src_snapshots)?;

    let base_position = match dst {
        None => None,
        Some(dst) => {
            let dst_names: HashSet<&str> = dst.snapshots.iter().map(String::as_str).collect();
            let base_position = src_parsed.iter().rposition(|p| dst_names.contains(p.name.as_str()));

            if base_position.is_none() {
                if !dst.snapshots.is_empty() {
                    if !task.allow_from_scratch {
                        return Err(ReplicationError::NoIncrementalBase {
                            dataset: src_dataset.to_string(),
                        });
                    }
                    plan.destroy_dst_snapshots = dst.snapshots.clone();
                } else if dst.info.used > foreign_data_threshold && !task.allow_from_scratch {
                    return Err(ReplicationError::TargetHasData {
                        dataset: dst_dataset.to_string(),
                        used: dst.info.used,
                    });
                }
            }
            base_position
        }
    };

    let start = match base_position {
        Some(position) => {
            plan.incremental_base = Some(src_parsed[position].name.clone());
            position + 1
        }
        None => 0,
    };

    plan.snapshots = src_parsed[start..]
        .iter()
        .filter(|p| task.should_replicate(p))
        .map(|p| p.name.clone())
        .collect();

    Ok(plan)
}
