//! # Snapshot Replication
//!
//! Periodic snapshots, retention and incremental replication for
//! copy-on-write storage volumes organised as a dataset tree.
//!
//! ## Architecture
//!
//! A minute scheduler drives three kinds of work against two snapshot stores
//! (the local one and the far side of a transport):
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          snapshot-replication                             │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌──────────────────────────┐  │
//! │  │ Clock       │───►│ Scheduler        │───►│ Periodic snapshot tasks  │  │
//! │  │ + TzClock   │    │ (due + interrupt)│    │ (create, DST aware)      │  │
//! │  └─────────────┘    └──────────────────┘    └──────────────────────────┘  │
//! │                              │                           │                │
//! │                              ▼                           ▼                │
//! │                     ┌──────────────────┐    ┌──────────────────────────┐  │
//! │                     │ Replication      │    │ Retention                │  │
//! │                     │ (plan, transfer, │    │ (snapshot owners vote)   │  │
//! │                     │  stuck monitor)  │    │                          │  │
//! │                     └──────────────────┘    └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The storage layer and the byte-stream transfer are traits
//! ([`SnapshotStore`], [`ReplicationTransport`]); this crate decides *what*
//! to create, send and destroy, and *when*.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use snapshot_replication::{EngineConfig, NoOpObserver, ReplicationEngine, ReplicationError, SystemTimeSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> snapshot_replication::Result<()> {
//!     let text = std::fs::read_to_string("engine.json").expect("config file");
//!     let config: EngineConfig =
//!         serde_json::from_str(&text).map_err(|e| ReplicationError::Config(e.to_string()))?;
//!     let engine = ReplicationEngine::new(
//!         config,
//!         my_local_store(),
//!         my_transport_factory(),
//!         Arc::new(NoOpObserver),
//!         Arc::new(SystemTimeSource),
//!     )?;
//!
//!     // Runs until shutdown() is called
//!     engine.run().await
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod observer;
pub mod replication;
pub mod resilience;
pub mod retention;
pub mod schedule;
pub mod task;
pub mod transport;

// Re-exports for convenience
pub use config::{EngineConfig, EngineSettings, PeriodicSnapshotTaskDefinition, ReplicationTaskDefinition};
pub use coordinator::{EngineState, ReplicationEngine};
pub use dataset::Snapshot;
pub use error::{ReplicationError, Result};
pub use naming::{NamingSchema, ParsedSnapshotName};
pub use observer::{NoOpObserver, Observer, ObserverEvent};
pub use schedule::{CronSchedule, SystemTimeSource, TimeSource};
pub use transport::{ReplicationTransport, SnapshotStore, TransferProcess, TransportFactory};
