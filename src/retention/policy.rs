//! Destination-side retention policies.

use crate::config::{parse_duration, ReplicationTaskDefinition, RetentionPolicyKind};
use crate::error::{ReplicationError, Result};
use crate::naming::ParsedSnapshotName;
use crate::schedule::CronSchedule;
use crate::task::to_chrono;
use chrono::{Duration, NaiveDateTime};

/// What a replication task keeps on its destination.
///
/// A pure function of declared data, re-evaluated on every pass.
#[derive(Debug, Clone)]
pub enum RetentionPolicy {
    /// Keep a destination snapshot iff the source still has it.
    SameAsSource,
    /// Age-based expiry. A snapshot matching one or more override schedules
    /// lives for the longest matching override lifetime instead of `period`.
    Custom {
        period: Duration,
        overrides: Vec<(CronSchedule, Duration)>,
    },
    /// Never delete.
    None,
}

impl RetentionPolicy {
    pub fn from_definition(def: &ReplicationTaskDefinition) -> Result<Self> {
        match def.retention_policy {
            RetentionPolicyKind::Source => Ok(Self::SameAsSource),
            RetentionPolicyKind::None => Ok(Self::None),
            RetentionPolicyKind::Custom => {
                let lifetime = def.lifetime.as_deref().ok_or_else(|| {
                    ReplicationError::Config("custom retention policy requires a lifetime".to_string())
                })?;
                let period = to_chrono(parse_duration(lifetime, "lifetime")?, "lifetime")?;
                let mut overrides = Vec::with_capacity(def.lifetimes.len());
                for (name, entry) in &def.lifetimes {
                    let schedule = CronSchedule::from_definition(&entry.schedule)?;
                    let lifetime = to_chrono(
                        parse_duration(&entry.lifetime, &format!("lifetimes.{name}"))?,
                        "lifetime",
                    )?;
                    overrides.push((schedule, lifetime));
                }
                Ok(Self::Custom { period, overrides })
            }
        }
    }

    /// Destination snapshots to delete.
    ///
    /// `now` is local wall time. Ages are measured from each snapshot's
    /// idealized datetime; names without a datetime never expire.
    pub fn calculate_delete_snapshots(
        &self,
        now: NaiveDateTime,
        src: &[ParsedSnapshotName],
        dst: &[ParsedSnapshotName],
    ) -> Vec<ParsedSnapshotName> {
        match self {
            Self::SameAsSource => dst.iter().filter(|d| !src.contains(d)).cloned().collect(),
            Self::Custom { period, overrides } => dst
                .iter()
                .filter(|d| {
                    let Some(datetime) = d.idealized_datetime() else {
                        return false;
                    };
                    let lifetime = overrides
                        .iter()
                        .filter(|(schedule, _)| schedule.should_run(datetime))
                        .map(|(_, lifetime)| *lifetime)
                        .max()
                        .unwrap_or(*period);
                    datetime < now - lifetime
                })
                .cloned()
                .collect(),
            Self::None => Vec::new(),
        }
    }
}
