//! Replication planning and step execution.
//!
//! - [`plan`]: incremental base selection and per-dataset transfer plans
//! - [`transfer`]: one supervised transfer step (stuck monitor, progress)
//! - [`pre_retention`]: destination pruning right before a transfer

pub mod plan;
pub mod pre_retention;
pub mod transfer;

pub use plan::{check_target, plan_transfer, DatasetInfo, Destination, ReplicationStep, TransferPlan};
pub use pre_retention::pre_retention_snapshots;
pub use transfer::{StuckMonitor, TransferRunner};
