// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage and transport integration traits.
//!
//! Defines the interface the engine needs from the snapshot storage on each
//! side and from the transfer primitive between them. The embedding daemon
//! provides implementations (local commands, SSH); tests use in-memory mocks.
//!
//! # Example
//!
//! ```rust,no_run
//! use snapshot_replication::transport::{BoxFuture, CreateSnapshot, DestroyFailure, SnapshotStore};
//! use snapshot_replication::dataset::Snapshot;
//! use std::collections::BTreeMap;
//!
//! struct MyStore { /* ... */ }
//!
//! impl SnapshotStore for MyStore {
//!     fn list_datasets(&self, root: &str, _recursive: bool) -> BoxFuture<'_, Vec<String>> {
//!         let root = root.to_string();
//!         Box::pin(async move { Ok(vec![root]) })
//!     }
//!
//!     fn list_snapshots(&self, _dataset: &str, _recursive: bool) -> BoxFuture<'_, Vec<Snapshot>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn create_snapshot(&self, _request: CreateSnapshot) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn destroy_snapshots(&self, _dataset: &str, _names: Vec<String>) -> BoxFuture<'_, Vec<DestroyFailure>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn get_raw_properties(&self, _dataset: &str, _names: Vec<String>) -> BoxFuture<'_, BTreeMap<String, String>> {
//!         Box::pin(async move { Ok(BTreeMap::new()) })
//!     }
//!
//!     fn set_property(&self, _dataset: &str, _name: &str, _value: &str) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn get_resume_token(&self, _dataset: &str) -> BoxFuture<'_, Option<String>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::config::{Direction, EncryptionDefinition, TransportDefinition};
use crate::dataset::{self, Snapshot};
use crate::error::{ReplicationError, Result};
use crate::replication::plan::ReplicationStep;
use crate::retention::SnapshotsByDataset;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Snapshot-creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshot {
    pub dataset: String,
    pub name: String,
    pub recursive: bool,
    pub exclude: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

/// Why a single snapshot in a destroy batch was not destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyFailureReason {
    /// Already gone.
    NotFound,
    /// Held or in use.
    Busy,
    HasDependentClones,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyFailure {
    pub name: String,
    pub reason: DestroyFailureReason,
}

/// Typed property lookups for [`get_properties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Bool,
    Str,
    /// Unsigned byte count.
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Str(String),
    Bytes(u64),
    /// Property not applicable (`-`).
    Unset,
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<u64> {
        match self {
            Self::Bytes(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Snapshot storage on one side of a replication.
///
/// Implementations convert borrowed arguments to owned values before moving
/// them into the returned future.
pub trait SnapshotStore: Send + Sync + 'static {
    /// `root` and (if `recursive`) its descendants, parents first.
    /// Fails with [`ReplicationError::DatasetNotFound`] if `root` is missing.
    fn list_datasets(&self, root: &str, recursive: bool) -> BoxFuture<'_, Vec<String>>;

    /// Snapshots of `dataset` (and descendants) in creation order.
    fn list_snapshots(&self, dataset: &str, recursive: bool) -> BoxFuture<'_, Vec<Snapshot>>;

    /// Snapshot names for several `(dataset, recursive)` queries at once.
    ///
    /// Overlapping queries are simplified first; missing datasets are skipped.
    fn multilist_snapshots(&self, queries: Vec<(String, bool)>) -> BoxFuture<'_, SnapshotsByDataset> {
        Box::pin(async move {
            let mut result = SnapshotsByDataset::new();
            for (dataset, recursive) in simplify_snapshot_list_queries(queries) {
                match self.list_snapshots(&dataset, recursive).await {
                    Ok(snapshots) => {
                        for snapshot in snapshots {
                            result.entry(snapshot.dataset).or_default().push(snapshot.name);
                        }
                    }
                    Err(ReplicationError::DatasetNotFound(missing)) => {
                        debug!(dataset = %missing, "Dataset vanished while listing snapshots");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(result)
        })
    }

    /// Create a (possibly recursive) snapshot. A partial failure is an error
    /// naming the children that failed.
    fn create_snapshot(&self, request: CreateSnapshot) -> BoxFuture<'_, ()>;

    /// Destroy `names` on `dataset` in one call.
    ///
    /// Per-item failures are returned, not raised; `Err` means the call as a
    /// whole failed.
    fn destroy_snapshots(&self, dataset: &str, names: Vec<String>) -> BoxFuture<'_, Vec<DestroyFailure>>;

    /// Raw property values by name.
    /// Fails with [`ReplicationError::DatasetNotFound`] if `dataset` is missing.
    fn get_raw_properties(&self, dataset: &str, names: Vec<String>) -> BoxFuture<'_, BTreeMap<String, String>>;

    fn set_property(&self, dataset: &str, name: &str, value: &str) -> BoxFuture<'_, ()>;

    /// Receive resume token, `None` if there is no interrupted receive.
    fn get_resume_token(&self, dataset: &str) -> BoxFuture<'_, Option<String>>;
}

/// What a finished transfer reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Non-fatal problems, e.g. properties the receiver could not set.
    pub warnings: Vec<String>,
}

/// An in-flight transfer. `wait` and `stop` may be called concurrently.
pub trait TransferProcess: Send + Sync {
    fn wait(&self) -> BoxFuture<'_, TransferOutcome>;

    /// Hard-stop the transfer; a pending `wait` then resolves with an error.
    fn stop(&self) -> BoxFuture<'_, ()>;
}

/// Per-task transfer flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub properties: bool,
    pub replicate: bool,
    pub exclude: Vec<String>,
    pub speed_limit: Option<u64>,
    pub encryption: Option<EncryptionDefinition>,
}

/// Connection to the remote side of a replication task.
pub trait ReplicationTransport: Send + Sync {
    /// Host identity; tasks sharing it run serially.
    fn id(&self) -> String;

    /// Storage on the remote host.
    fn remote_store(&self) -> Arc<dyn SnapshotStore>;

    /// Start one snapshot-step transfer.
    fn spawn_transfer(
        &self,
        direction: Direction,
        step: ReplicationStep,
        options: TransferOptions,
    ) -> BoxFuture<'_, Box<dyn TransferProcess>>;
}

/// Builds transports from their definitions.
pub trait TransportFactory: Send + Sync {
    fn create(&self, definition: &TransportDefinition) -> Result<Arc<dyn ReplicationTransport>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers on top of SnapshotStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Drop queries covered by a recursive query on the same or an ancestor
/// dataset, and duplicates.
pub fn simplify_snapshot_list_queries(mut queries: Vec<(String, bool)>) -> Vec<(String, bool)> {
    // Recursive first so a recursive query wins over a plain one on the same dataset.
    queries.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    queries.dedup_by(|a, b| a.0 == b.0);

    let recursive_roots: Vec<String> = queries.iter().filter(|q| q.1).map(|q| q.0.clone()).collect();
    queries
        .into_iter()
        .filter(|(dataset, _)| {
            !recursive_roots
                .iter()
                .any(|root| root != dataset && dataset::is_child(dataset, root))
        })
        .collect()
}

/// Split `names` into destroy calls whose argument (`dataset@a,b,c`) stays
/// within `arg_max` bytes. A single over-long name gets its own call.
pub fn chunk_destroy_names(dataset: &str, names: &[String], arg_max: usize) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut length = dataset.len() + 1;

    for name in names {
        let added = name.len() + usize::from(!current.is_empty());
        if !current.is_empty() && length + added > arg_max {
            chunks.push(std::mem::take(&mut current));
            length = dataset.len() + 1;
        }
        length += name.len() + usize::from(!current.is_empty());
        current.push(name.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Result of [`destroy_snapshots`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestroyReport {
    pub destroyed: Vec<Snapshot>,
    pub failed: Vec<(Snapshot, DestroyFailureReason)>,
}

/// Destroy `snapshots`, batched per dataset.
///
/// Per-item failures and failed calls are logged and skipped; the rest of
/// the batch still runs.
pub async fn destroy_snapshots(store: &dyn SnapshotStore, snapshots: &[Snapshot], arg_max: usize) -> DestroyReport {
    let mut by_dataset: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for snapshot in snapshots {
        by_dataset.entry(snapshot.dataset.as_str()).or_default().push(snapshot.name.clone());
    }

    let mut report = DestroyReport::default();
    for (dataset, names) in by_dataset {
        for chunk in chunk_destroy_names(dataset, &names, arg_max) {
            debug!(dataset, count = chunk.len(), "Destroying snapshots");
            match store.destroy_snapshots(dataset, chunk.clone()).await {
                Ok(failures) => {
                    for name in chunk {
                        match failures.iter().find(|f| f.name == name) {
                            Some(failure) => {
                                match &failure.reason {
                                    DestroyFailureReason::NotFound => {
                                        debug!(dataset, snapshot = %name, "Snapshot already destroyed");
                                    }
                                    reason => {
                                        warn!(dataset, snapshot = %name, reason = ?reason, "Failed to destroy snapshot");
                                    }
                                }
                                report.failed.push((Snapshot::new(dataset, name), failure.reason.clone()));
                            }
                            None => report.destroyed.push(Snapshot::new(dataset, name)),
                        }
                    }
                }
                Err(e) => {
                    warn!(dataset, error = %e, "Destroy call failed");
                    let reason = DestroyFailureReason::Other(e.to_string());
                    report
                        .failed
                        .extend(chunk.into_iter().map(|name| (Snapshot::new(dataset, name), reason.clone())));
                }
            }
        }
    }
    report
}

/// Typed property lookup.
pub async fn get_properties(
    store: &dyn SnapshotStore,
    dataset: &str,
    properties: &[(&str, PropertyKind)],
) -> Result<BTreeMap<String, PropertyValue>> {
    let names = properties.iter().map(|(name, _)| name.to_string()).collect();
    let raw = store.get_raw_properties(dataset, names).await?;

    let mut result = BTreeMap::new();
    for (name, kind) in properties {
        let text = raw.get(*name).map(String::as_str).unwrap_or("-");
        result.insert(name.to_string(), parse_property(dataset, name, text, *kind)?);
    }
    Ok(result)
}

fn parse_property(dataset: &str, name: &str, text: &str, kind: PropertyKind) -> Result<PropertyValue> {
    if text == "-" {
        return Ok(PropertyValue::Unset);
    }
    let invalid = || ReplicationError::command("get properties", format!("invalid value '{text}' for {dataset} property {name}"));
    Ok(match kind {
        PropertyKind::Bool => match text {
            "on" | "yes" | "true" => PropertyValue::Bool(true),
            "off" | "no" | "false" => PropertyValue::Bool(false),
            _ => return Err(invalid()),
        },
        PropertyKind::Str => PropertyValue::Str(text.to_string()),
        PropertyKind::Bytes => PropertyValue::Bytes(text.parse().map_err(|_| invalid())?),
    })
}
