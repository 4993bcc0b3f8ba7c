//! Configuration for the replication engine.
//!
//! This module defines the declarative task definitions and engine settings.
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON by
//! the embedding binary. Definitions are validated when they are turned into
//! tasks (see [`crate::task`]), not here.
//!
//! # Quick Start
//!
//! ```rust
//! use snapshot_replication::config::{EngineConfig, PeriodicSnapshotTaskDefinition};
//!
//! let mut config = EngineConfig::for_testing();
//! config.periodic_snapshot_tasks.insert(
//!     "hourly".into(),
//!     PeriodicSnapshotTaskDefinition::for_testing("pool/data", "auto-%Y-%m-%d_%H-%M"),
//! );
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── timezone: String                     # IANA name, local time for schedules
//! ├── once: bool                           # single tick, then exit
//! ├── max-parallel-replication-tasks       # bulkhead size (unset = unlimited)
//! ├── settings: EngineSettings
//! │   ├── stuck-monitor                    # resume-token liveness check
//! │   ├── partial-state-retry              # "partially-complete state" backoff
//! │   ├── command-timeout                  # scoped timeout for store calls
//! │   └── foreign-data-threshold-bytes     # refuse to overwrite above this
//! ├── periodic-snapshot-tasks: {id: PeriodicSnapshotTaskDefinition}
//! └── replication-tasks: {id: ReplicationTaskDefinition}
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! timezone: "Europe/Berlin"
//!
//! periodic-snapshot-tasks:
//!   hourly:
//!     dataset: pool/data
//!     recursive: true
//!     lifetime: "2 weeks"
//!     naming-schema: "auto-%Y-%m-%d_%H-%M"
//!     schedule:
//!       minute: "0"
//!
//! replication-tasks:
//!   offsite:
//!     direction: push
//!     transport:
//!       type: ssh
//!       hostname: backup.example.com
//!     source-dataset: [pool/data]
//!     target-dataset: backup/data
//!     recursive: true
//!     periodic-snapshot-tasks: [hourly]
//!     retention-policy: source
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Local timezone schedules are evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Produce exactly one tick, then stop.
    #[serde(default)]
    pub once: bool,

    /// Upper bound on concurrently running replication groups.
    #[serde(default)]
    pub max_parallel_replication_tasks: Option<usize>,

    #[serde(default)]
    pub settings: EngineSettings,

    #[serde(default)]
    pub periodic_snapshot_tasks: BTreeMap<String, PeriodicSnapshotTaskDefinition>,

    #[serde(default)]
    pub replication_tasks: BTreeMap<String, ReplicationTaskDefinition>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            once: false,
            max_parallel_replication_tasks: None,
            settings: EngineSettings::default(),
            periodic_snapshot_tasks: BTreeMap::new(),
            replication_tasks: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Create a minimal config for testing.
    pub fn for_testing() -> Self {
        Self::default()
    }

    /// Resolve the configured timezone.
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse()
            .map_err(|e| ReplicationError::Config(format!("invalid timezone '{}': {e}", self.timezone)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineSettings: retry, monitor and store-call tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineSettings {
    #[serde(default)]
    pub stuck_monitor: StuckMonitorConfig,

    #[serde(default)]
    pub partial_state_retry: PartialStateRetryConfig,

    /// Timeout for individual store calls as a duration string (e.g., "5m").
    /// Unset means no timeout.
    #[serde(default)]
    pub command_timeout: Option<String>,

    /// How often the transfer progress observer samples dataset sizes.
    #[serde(default = "default_progress_interval_sec")]
    pub progress_interval_sec: u64,

    /// A destination with no snapshots but more data than this is refused.
    #[serde(default = "default_foreign_data_threshold_bytes")]
    pub foreign_data_threshold_bytes: u64,

    /// Argument-length ceiling for a single destroy call.
    #[serde(default = "default_destroy_arg_max")]
    pub destroy_arg_max: usize,
}

fn default_progress_interval_sec() -> u64 {
    10
}

fn default_foreign_data_threshold_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_destroy_arg_max() -> usize {
    128 * 1024
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stuck_monitor: StuckMonitorConfig::default(),
            partial_state_retry: PartialStateRetryConfig::default(),
            command_timeout: None,
            progress_interval_sec: default_progress_interval_sec(),
            foreign_data_threshold_bytes: default_foreign_data_threshold_bytes(),
            destroy_arg_max: default_destroy_arg_max(),
        }
    }
}

impl EngineSettings {
    /// Parse `command_timeout`. `None` if unset.
    pub fn command_timeout_duration(&self) -> Result<Option<Duration>> {
        self.command_timeout
            .as_deref()
            .map(|text| parse_duration(text, "command-timeout"))
            .transpose()
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_sec.max(1))
    }
}

/// Resume-token liveness check run alongside every transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StuckMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between resume-token polls.
    #[serde(default = "default_monitor_interval_sec")]
    pub interval_sec: u64,

    /// Identical consecutive polls that declare the transfer stuck.
    #[serde(default = "default_monitor_window")]
    pub window: usize,
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval_sec() -> u64 {
    60
}

fn default_monitor_window() -> usize {
    5
}

impl Default for StuckMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            window: 5,
        }
    }
}

impl StuckMonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }
}

/// Fixed backoff for a destination reporting partially-complete state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PartialStateRetryConfig {
    #[serde(default = "default_partial_interval_sec")]
    pub interval_sec: u64,

    /// Attempts before giving up, including the first.
    #[serde(default = "default_partial_max_attempts")]
    pub max_attempts: usize,
}

fn default_partial_interval_sec() -> u64 {
    60
}

fn default_partial_max_attempts() -> usize {
    60
}

impl Default for PartialStateRetryConfig {
    fn default() -> Self {
        Self {
            interval_sec: 60,
            max_attempts: 60,
        }
    }
}

impl PartialStateRetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleDefinition: cron fields plus a time-of-day window
// ═══════════════════════════════════════════════════════════════════════════════

/// Cron fields default to `*`; the window defaults to the whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleDefinition {
    #[serde(default = "default_any")]
    pub minute: String,
    #[serde(default = "default_any")]
    pub hour: String,
    #[serde(default = "default_any")]
    pub day_of_month: String,
    #[serde(default = "default_any")]
    pub month: String,
    #[serde(default = "default_any")]
    pub day_of_week: String,
    #[serde(default = "default_begin")]
    pub begin: String,
    #[serde(default = "default_end")]
    pub end: String,
}

fn default_any() -> String {
    "*".to_string()
}

fn default_begin() -> String {
    "00:00".to_string()
}

fn default_end() -> String {
    "23:59".to_string()
}

impl Default for ScheduleDefinition {
    fn default() -> Self {
        Self {
            minute: default_any(),
            hour: default_any(),
            day_of_month: default_any(),
            month: default_any(),
            day_of_week: default_any(),
            begin: default_begin(),
            end: default_end(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeriodicSnapshotTaskDefinition
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeriodicSnapshotTaskDefinition {
    pub dataset: String,

    #[serde(default)]
    pub recursive: bool,

    #[serde(default)]
    pub exclude: Vec<String>,

    /// How long snapshots are kept, e.g. "2 weeks".
    pub lifetime: String,

    pub naming_schema: String,

    #[serde(default)]
    pub schedule: ScheduleDefinition,

    /// Take snapshots even if nothing was written since the last one.
    #[serde(default = "default_true")]
    pub allow_empty: bool,
}

impl PeriodicSnapshotTaskDefinition {
    /// Every-minute, one-day-lifetime task for testing.
    pub fn for_testing(dataset: &str, naming_schema: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            recursive: false,
            exclude: Vec::new(),
            lifetime: "1d".to_string(),
            naming_schema: naming_schema.to_string(),
            schedule: ScheduleDefinition::default(),
            allow_empty: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationTaskDefinition
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicyKind {
    /// Keep what the source keeps.
    Source,
    /// Age-based, with per-schedule overrides.
    Custom,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadonlyPolicy {
    #[default]
    Ignore,
    /// Set `readonly=on` on the target after a successful transfer.
    Set,
    /// Refuse an existing target that is not `readonly=on`.
    Require,
}

/// Opaque transport description; interpreted by the embedding
/// [`TransportFactory`](crate::transport::TransportFactory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransportDefinition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(flatten)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl TransportDefinition {
    pub fn local() -> Self {
        Self {
            kind: "local".to_string(),
            hostname: None,
            port: None,
            username: None,
            options: BTreeMap::new(),
        }
    }

    /// Host identity. Tasks with equal ids run serially.
    pub fn id(&self) -> String {
        match &self.hostname {
            Some(host) => format!("{}:{}@{}:{}", self.kind, self.username.as_deref().unwrap_or(""), host, self.port.unwrap_or(0)),
            None => self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    Hex,
    Passphrase,
}

/// Requested destination encryption. Key provisioning is the store's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionDefinition {
    pub key: String,
    pub key_format: KeyFormat,
    pub key_location: String,
}

/// Per-schedule lifetime override for `custom` retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LifetimeDefinition {
    pub schedule: ScheduleDefinition,
    pub lifetime: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplicationTaskDefinition {
    pub direction: Direction,

    pub transport: TransportDefinition,

    pub source_dataset: Vec<String>,

    pub target_dataset: String,

    #[serde(default)]
    pub recursive: bool,

    #[serde(default)]
    pub exclude: Vec<String>,

    /// Send dataset properties along with the data.
    #[serde(default = "default_true")]
    pub properties: bool,

    /// Replicate the whole filesystem tree as one stream.
    #[serde(default)]
    pub replicate: bool,

    /// Bound periodic snapshot task ids (push only).
    #[serde(default)]
    pub periodic_snapshot_tasks: Vec<String>,

    /// Naming schemas for pull tasks.
    #[serde(default)]
    pub naming_schema: Vec<String>,

    /// Extra naming schemas for push tasks.
    #[serde(default)]
    pub also_include_naming_schema: Vec<String>,

    /// Regular expression selecting snapshots by name instead of by schema.
    #[serde(default)]
    pub name_regex: Option<String>,

    #[serde(default = "default_true")]
    pub auto: bool,

    #[serde(default)]
    pub schedule: Option<ScheduleDefinition>,

    /// Only replicate periodic snapshots taken at these times.
    #[serde(default)]
    pub restrict_schedule: Option<ScheduleDefinition>,

    /// Only replicate snapshots matching the task's own schedule.
    #[serde(default)]
    pub only_matching_schedule: bool,

    #[serde(default)]
    pub allow_from_scratch: bool,

    /// Keep source snapshots until they have been replicated.
    #[serde(default = "default_true")]
    pub hold_pending_snapshots: bool,

    #[serde(default)]
    pub retention_policy: RetentionPolicyKind,

    /// Period for `custom` retention.
    #[serde(default)]
    pub lifetime: Option<String>,

    /// Per-schedule overrides for `custom` retention.
    #[serde(default)]
    pub lifetimes: BTreeMap<String, LifetimeDefinition>,

    /// Retry budget for recoverable transfer errors.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Bytes per second, unset for unlimited.
    #[serde(default)]
    pub speed_limit: Option<u64>,

    #[serde(default)]
    pub readonly: ReadonlyPolicy,

    #[serde(default)]
    pub encryption: Option<EncryptionDefinition>,
}

fn default_retries() -> u32 {
    5
}

impl ReplicationTaskDefinition {
    /// Local push task bound to `periodic` for testing.
    pub fn for_testing(source: &str, target: &str, periodic: &[&str]) -> Self {
        Self {
            direction: Direction::Push,
            transport: TransportDefinition::local(),
            source_dataset: vec![source.to_string()],
            target_dataset: target.to_string(),
            recursive: false,
            exclude: Vec::new(),
            properties: true,
            replicate: false,
            periodic_snapshot_tasks: periodic.iter().map(|s| s.to_string()).collect(),
            naming_schema: Vec::new(),
            also_include_naming_schema: Vec::new(),
            name_regex: None,
            auto: true,
            schedule: None,
            restrict_schedule: None,
            only_matching_schedule: false,
            allow_from_scratch: false,
            hold_pending_snapshots: true,
            retention_policy: RetentionPolicyKind::Source,
            lifetime: None,
            lifetimes: BTreeMap::new(),
            retries: default_retries(),
            speed_limit: None,
            readonly: ReadonlyPolicy::Ignore,
            encryption: None,
        }
    }
}

/// Parse a humantime duration string, mapping failures to a config error.
pub fn parse_duration(text: &str, field: &str) -> Result<Duration> {
    humantime::parse_duration(text)
        .map_err(|e| ReplicationError::Config(format!("invalid {field} '{text}': {e}")))
}
