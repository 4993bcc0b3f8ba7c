//! In-memory snapshot store and scripted transport.
//!
//! `MockStore` keeps a dataset tree with snapshot lists, raw properties and
//! resume tokens, and records every create and destroy. `MockTransportFactory`
//! copies snapshots between two stores when a transfer is waited on; failures
//! can be queued per transfer.

#![allow(dead_code)]

use snapshot_replication::config::{Direction, TransportDefinition};
use snapshot_replication::dataset::{self, Snapshot};
use snapshot_replication::replication::ReplicationStep;
use snapshot_replication::transport::{
    BoxFuture, CreateSnapshot, DestroyFailure, DestroyFailureReason, ReplicationTransport, SnapshotStore,
    TransferOptions, TransferOutcome, TransferProcess, TransportFactory,
};
use snapshot_replication::{Observer, ObserverEvent, ReplicationError, Result};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
struct MockDataset {
    snapshots: Vec<String>,
    properties: BTreeMap<String, String>,
    resume_token: Option<String>,
}

// =============================================================================
// MockStore
// =============================================================================

/// In-memory [`SnapshotStore`].
///
/// # Example
/// ```rust,ignore
/// let store = MockStore::new();
/// store.add_snapshots("pool/data", &["auto-2021-04-21_11-00"]);
///
/// // Use in tests...
///
/// assert_eq!(store.destroyed(), vec!["pool/data@auto-2021-04-20_11-00"]);
/// ```
#[derive(Default)]
pub struct MockStore {
    datasets: Mutex<BTreeMap<String, MockDataset>>,
    created: Mutex<Vec<CreateSnapshot>>,
    destroyed: Mutex<Vec<String>>,
    /// `dataset@name` entries that refuse to be destroyed
    busy: Mutex<HashSet<String>>,
    /// Fail every call once set
    broken: Mutex<Option<String>>,
    /// Resume token lookups answered before the rest never resolve
    token_lookups_before_hang: Mutex<Option<usize>>,
    token_lookups: Mutex<usize>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_dataset(&self, dataset: &str) {
        self.datasets.lock().unwrap().entry(dataset.to_string()).or_default();
    }

    pub fn add_snapshots(&self, dataset: &str, names: &[&str]) {
        let mut datasets = self.datasets.lock().unwrap();
        let entry = datasets.entry(dataset.to_string()).or_default();
        entry.snapshots.extend(names.iter().map(|n| n.to_string()));
    }

    pub fn set_property(&self, dataset: &str, name: &str, value: &str) {
        let mut datasets = self.datasets.lock().unwrap();
        let entry = datasets.entry(dataset.to_string()).or_default();
        entry.properties.insert(name.to_string(), value.to_string());
    }

    pub fn set_resume_token(&self, dataset: &str, token: Option<&str>) {
        let mut datasets = self.datasets.lock().unwrap();
        let entry = datasets.entry(dataset.to_string()).or_default();
        entry.resume_token = token.map(str::to_string);
    }

    pub fn set_busy(&self, snapshot: &str) {
        self.busy.lock().unwrap().insert(snapshot.to_string());
    }

    pub fn break_with(&self, message: &str) {
        *self.broken.lock().unwrap() = Some(message.to_string());
    }

    /// Answer `count` resume token lookups, then hang on every later one.
    pub fn hang_token_lookups_after(&self, count: usize) {
        *self.token_lookups_before_hang.lock().unwrap() = Some(count);
    }

    pub fn token_lookups(&self) -> usize {
        *self.token_lookups.lock().unwrap()
    }

    pub fn has_dataset(&self, dataset: &str) -> bool {
        self.datasets.lock().unwrap().contains_key(dataset)
    }

    pub fn snapshots(&self, dataset: &str) -> Vec<String> {
        self.datasets
            .lock()
            .unwrap()
            .get(dataset)
            .map(|d| d.snapshots.clone())
            .unwrap_or_default()
    }

    pub fn property(&self, dataset: &str, name: &str) -> Option<String> {
        self.datasets
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|d| d.properties.get(name).cloned())
    }

    pub fn resume_token(&self, dataset: &str) -> Option<String> {
        self.datasets
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|d| d.resume_token.clone())
    }

    pub fn created(&self) -> Vec<CreateSnapshot> {
        self.created.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    /// Record a received snapshot, creating the dataset if needed.
    fn receive(&self, dataset: &str, name: &str) {
        let mut datasets = self.datasets.lock().unwrap();
        let entry = datasets.entry(dataset.to_string()).or_default();
        entry.resume_token = None;
        if !entry.snapshots.iter().any(|s| s == name) {
            entry.snapshots.push(name.to_string());
        }
    }

    fn check(&self) -> Result<()> {
        match &*self.broken.lock().unwrap() {
            Some(message) => Err(ReplicationError::command("mock", message.clone())),
            None => Ok(()),
        }
    }

    fn descendants(&self, root: &str, recursive: bool) -> Result<Vec<String>> {
        self.check()?;
        let datasets = self.datasets.lock().unwrap();
        if !datasets.contains_key(root) {
            return Err(ReplicationError::DatasetNotFound(root.to_string()));
        }
        let mut found: Vec<String> = datasets
            .keys()
            .filter(|ds| *ds == root || (recursive && dataset::is_child(ds, root)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.split('/').cmp(b.split('/')));
        Ok(found)
    }
}

impl SnapshotStore for MockStore {
    fn list_datasets(&self, root: &str, recursive: bool) -> BoxFuture<'_, Vec<String>> {
        let result = self.descendants(root, recursive);
        Box::pin(async move { result })
    }

    fn list_snapshots(&self, dataset: &str, recursive: bool) -> BoxFuture<'_, Vec<Snapshot>> {
        let result = self.descendants(dataset, recursive).map(|found| {
            let datasets = self.datasets.lock().unwrap();
            found
                .into_iter()
                .flat_map(|ds| {
                    let names = datasets.get(&ds).map(|d| d.snapshots.clone()).unwrap_or_default();
                    names.into_iter().map(move |name| Snapshot::new(ds.clone(), name))
                })
                .collect()
        });
        Box::pin(async move { result })
    }

    fn create_snapshot(&self, request: CreateSnapshot) -> BoxFuture<'_, ()> {
        let result = self.descendants(&request.dataset, request.recursive).and_then(|found| {
            let mut datasets = self.datasets.lock().unwrap();
            for ds in found {
                if request.exclude.iter().any(|ex| dataset::is_child(&ds, ex)) {
                    continue;
                }
                let entry = datasets.entry(ds.clone()).or_default();
                if entry.snapshots.contains(&request.name) {
                    return Err(ReplicationError::command(
                        "create snapshot",
                        format!("{ds}@{} already exists", request.name),
                    ));
                }
                entry.snapshots.push(request.name.clone());
            }
            self.created.lock().unwrap().push(request);
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn destroy_snapshots(&self, dataset: &str, names: Vec<String>) -> BoxFuture<'_, Vec<DestroyFailure>> {
        let result = self.check().map(|()| {
            let busy = self.busy.lock().unwrap().clone();
            let mut datasets = self.datasets.lock().unwrap();
            let mut failures = Vec::new();
            for name in names {
                let full = format!("{dataset}@{name}");
                let Some(entry) = datasets.get_mut(dataset).filter(|d| d.snapshots.contains(&name)) else {
                    failures.push(DestroyFailure {
                        name,
                        reason: DestroyFailureReason::NotFound,
                    });
                    continue;
                };
                if busy.contains(&full) {
                    failures.push(DestroyFailure {
                        name,
                        reason: DestroyFailureReason::Busy,
                    });
                    continue;
                }
                entry.snapshots.retain(|s| *s != name);
                self.destroyed.lock().unwrap().push(full);
            }
            failures
        });
        Box::pin(async move { result })
    }

    fn get_raw_properties(&self, dataset: &str, names: Vec<String>) -> BoxFuture<'_, BTreeMap<String, String>> {
        let result = self.check().and_then(|()| {
            let datasets = self.datasets.lock().unwrap();
            let entry = datasets
                .get(dataset)
                .ok_or_else(|| ReplicationError::DatasetNotFound(dataset.to_string()))?;
            Ok(names
                .into_iter()
                .filter_map(|name| entry.properties.get(&name).map(|v| (name, v.clone())))
                .collect())
        });
        Box::pin(async move { result })
    }

    fn set_property(&self, dataset: &str, name: &str, value: &str) -> BoxFuture<'_, ()> {
        let result = self.check().and_then(|()| {
            let mut datasets = self.datasets.lock().unwrap();
            let entry = datasets
                .get_mut(dataset)
                .ok_or_else(|| ReplicationError::DatasetNotFound(dataset.to_string()))?;
            entry.properties.insert(name.to_string(), value.to_string());
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn get_resume_token(&self, dataset: &str) -> BoxFuture<'_, Option<String>> {
        let served = {
            let mut lookups = self.token_lookups.lock().unwrap();
            *lookups += 1;
            *lookups - 1
        };
        if self
            .token_lookups_before_hang
            .lock()
            .unwrap()
            .is_some_and(|limit| served >= limit)
        {
            return Box::pin(std::future::pending());
        }
        let result = self.check().map(|()| {
            self.datasets
                .lock()
                .unwrap()
                .get(dataset)
                .and_then(|d| d.resume_token.clone())
        });
        Box::pin(async move { result })
    }
}

// =============================================================================
// MockTransport
// =============================================================================

/// How the next transfer misbehaves.
#[derive(Debug, Clone)]
pub enum TransferFault {
    /// Fail without touching the destination.
    Error(ReplicationError),
    /// Leave a resume token on the destination and fail.
    Interrupt { token: String },
    /// Leave a resume token and never finish until stopped.
    Hang { token: String },
}

/// A transfer the mock performed (or attempted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCall {
    pub direction: Direction,
    pub step: ReplicationStep,
    pub options: TransferOptions,
}

struct TransportShared {
    local: Arc<MockStore>,
    remote: Arc<MockStore>,
    calls: Mutex<Vec<TransferCall>>,
    faults: Mutex<VecDeque<TransferFault>>,
    /// Resume token -> snapshot name it completes
    tokens: Mutex<BTreeMap<String, String>>,
}

/// Builds [`MockTransport`]s sharing one pair of stores.
#[derive(Clone)]
pub struct MockTransportFactory {
    shared: Arc<TransportShared>,
}

impl MockTransportFactory {
    pub fn new(local: Arc<MockStore>, remote: Arc<MockStore>) -> Self {
        Self {
            shared: Arc::new(TransportShared {
                local,
                remote,
                calls: Mutex::new(Vec::new()),
                faults: Mutex::new(VecDeque::new()),
                tokens: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Queue a fault for the next transfer.
    pub fn fail_next(&self, fault: TransferFault) {
        self.shared.faults.lock().unwrap().push_back(fault);
    }

    /// Declare which snapshot a pre-existing resume token completes.
    pub fn register_token(&self, token: &str, snapshot: &str) {
        self.shared
            .tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), snapshot.to_string());
    }

    pub fn calls(&self) -> Vec<TransferCall> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<ReplicationStep> {
        self.calls().into_iter().map(|c| c.step).collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, definition: &TransportDefinition) -> Result<Arc<dyn ReplicationTransport>> {
        Ok(Arc::new(MockTransport {
            id: definition.id(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

pub struct MockTransport {
    id: String,
    shared: Arc<TransportShared>,
}

impl ReplicationTransport for MockTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn remote_store(&self) -> Arc<dyn SnapshotStore> {
        self.shared.remote.clone()
    }

    fn spawn_transfer(
        &self,
        direction: Direction,
        step: ReplicationStep,
        options: TransferOptions,
    ) -> BoxFuture<'_, Box<dyn TransferProcess>> {
        self.shared.calls.lock().unwrap().push(TransferCall {
            direction,
            step: step.clone(),
            options,
        });
        let fault = self.shared.faults.lock().unwrap().pop_front();
        let (src, dst) = match direction {
            Direction::Push => (Arc::clone(&self.shared.local), Arc::clone(&self.shared.remote)),
            Direction::Pull => (Arc::clone(&self.shared.remote), Arc::clone(&self.shared.local)),
        };
        let process = MockProcess {
            shared: Arc::clone(&self.shared),
            src,
            dst,
            step,
            fault,
            stopped: Notify::new(),
        };
        Box::pin(async move { Ok(Box::new(process) as Box<dyn TransferProcess>) })
    }
}

struct MockProcess {
    shared: Arc<TransportShared>,
    src: Arc<MockStore>,
    dst: Arc<MockStore>,
    step: ReplicationStep,
    fault: Option<TransferFault>,
    stopped: Notify,
}

impl MockProcess {
    fn interrupt(&self, token: &str) {
        if let Some(snapshot) = &self.step.snapshot {
            self.shared
                .tokens
                .lock()
                .unwrap()
                .insert(token.to_string(), snapshot.clone());
        }
        self.dst.set_resume_token(&self.step.dst_dataset, Some(token));
    }

    fn complete(&self) -> Result<TransferOutcome> {
        let step = &self.step;
        let snapshot = match (&step.resume_token, &step.snapshot) {
            (Some(token), _) => self
                .shared
                .tokens
                .lock()
                .unwrap()
                .remove(token)
                .ok_or_else(|| ReplicationError::transfer(&step.dst_dataset, format!("unknown resume token {token}")))?,
            (None, Some(snapshot)) => snapshot.clone(),
            (None, None) => return Err(ReplicationError::transfer(&step.dst_dataset, "nothing to send")),
        };

        if step.resume_token.is_none() {
            if !self.src.snapshots(&step.src_dataset).contains(&snapshot) {
                return Err(ReplicationError::transfer(&step.src_dataset, format!("no such snapshot {snapshot}")));
            }
            let dst_snapshots = self.dst.snapshots(&step.dst_dataset);
            match &step.incremental_base {
                Some(base) if !dst_snapshots.contains(base) => {
                    return Err(ReplicationError::transfer(&step.dst_dataset, format!("base {base} missing")));
                }
                None if !dst_snapshots.is_empty() => {
                    return Err(ReplicationError::transfer(
                        &step.dst_dataset,
                        "destination has snapshots, full send refused",
                    ));
                }
                _ => {}
            }
        }

        self.dst.receive(&step.dst_dataset, &snapshot);
        Ok(TransferOutcome::default())
    }
}

impl TransferProcess for MockProcess {
    fn wait(&self) -> BoxFuture<'_, TransferOutcome> {
        Box::pin(async move {
            match &self.fault {
                None => self.complete(),
                Some(TransferFault::Error(e)) => Err(e.clone()),
                Some(TransferFault::Interrupt { token }) => {
                    self.interrupt(token);
                    Err(ReplicationError::transfer(&self.step.dst_dataset, "connection reset"))
                }
                Some(TransferFault::Hang { token }) => {
                    self.interrupt(token);
                    self.stopped.notified().await;
                    Err(ReplicationError::transfer(&self.step.dst_dataset, "killed"))
                }
            }
        })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        self.stopped.notify_one();
        Box::pin(async move { Ok(()) })
    }
}

// =============================================================================
// RecordingObserver
// =============================================================================

/// Observer that keeps every event.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ObserverEvent::ReplicationTaskError { error, .. } => Some(error),
                ObserverEvent::PeriodicSnapshotTaskError { error, .. } => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn succeeded(&self, task_id: &str) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, ObserverEvent::ReplicationTaskSuccess { task_id: id, .. } if id == task_id))
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, event: &ObserverEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Observer that panics on every event.
pub struct PanickingObserver;

impl Observer for PanickingObserver {
    fn notify(&self, event: &ObserverEvent) -> Result<()> {
        panic!("observer exploded on {event:?}");
    }
}
