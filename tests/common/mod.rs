//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - In-memory `MockStore` and scripted `MockTransportFactory`
//! - Recording and panicking observers
//! - A time source driven by tokio's (pausable) clock

#![allow(dead_code)]

pub mod mock_store;

pub use mock_store::*;

use chrono::{DateTime, TimeZone, Utc};
use snapshot_replication::{EngineConfig, ReplicationEngine, TimeSource};
use std::sync::Arc;

/// Wall clock starting at `origin` and advancing with `tokio::time`.
pub struct TestTimeSource {
    origin: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TestTimeSource {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            start: tokio::time::Instant::now(),
        }
    }
}

impl TimeSource for TestTimeSource {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap();
        self.origin + elapsed
    }
}

/// Route engine logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// 2021-04-21 12:00 UTC, the instant every test tick happens at.
pub fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 4, 21, 12, 0, 0).unwrap()
}

/// Everything a test needs to drive one engine.
pub struct Harness {
    pub local: Arc<MockStore>,
    pub remote: Arc<MockStore>,
    pub transports: MockTransportFactory,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new() -> Self {
        let local = MockStore::new();
        let remote = MockStore::new();
        let transports = MockTransportFactory::new(Arc::clone(&local), Arc::clone(&remote));
        Self {
            local,
            remote,
            transports,
            observer: RecordingObserver::new(),
        }
    }

    /// Build a run-once engine ticking at `now`.
    pub fn engine_at(&self, mut config: EngineConfig, now: DateTime<Utc>) -> ReplicationEngine {
        config.once = true;
        ReplicationEngine::new(
            config,
            self.local.clone(),
            Arc::new(self.transports.clone()),
            self.observer.clone(),
            Arc::new(TestTimeSource::new(now)),
        )
        .unwrap()
    }

    pub fn engine(&self, config: EngineConfig) -> ReplicationEngine {
        self.engine_at(config, noon())
    }
}
