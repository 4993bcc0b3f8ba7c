// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are grouped by how the engine reacts to them. Several display
//! strings are matched by downstream tooling, so their wording is stable.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Invalid task definition |
//! | `InvalidNamingSchema` | No | Naming schema rejected at construction |
//! | `AmbiguousSnapshotName` | No | Two schemas parse one name differently |
//! | `NoIncrementalBase` | No | No common snapshot, from-scratch disallowed |
//! | `TargetHasData` | No | Destination holds unrelated data |
//! | `TargetTypeMismatch` | No | Volume vs filesystem |
//! | `EncryptionMismatch` | No | Destination encryption relationship violated |
//! | `ReadonlyViolation` | No | Destination readonly policy violated |
//! | `Transfer` | Yes | Interrupted transfer, checksum mismatch, signal |
//! | `DatasetNotFound` | Yes | Dataset disappeared under us |
//! | `StuckTransfer` | Yes | Resume token stopped advancing |
//! | `PartiallyCompleteState` | Backoff | Destination mid-resume |
//! | `Timeout` | No | External command exceeded its timeout |
//! | `Command` | No | External command failed |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] decides whether a failed transfer step
//! consumes the task's retry budget. Partially-complete state is handled by a
//! separate fixed backoff (see [`crate::resilience`]) and does not touch that
//! budget.

use chrono::NaiveDateTime;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Substring the receiving side prints when it is mid-resume.
pub const PARTIALLY_COMPLETE_STATE_MARKER: &str = "contains partially-complete state";

/// Errors that can occur while scheduling, pruning or replicating.
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// Invalid task definition or engine configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Naming schema failed validation.
    #[error("Invalid naming schema '{schema}': {reason}")]
    InvalidNamingSchema { schema: String, reason: String },

    /// One raw name parsed into different instants by two schemas.
    #[error("Snapshot name '{name}' was parsed ambiguously: as {first}, and, with naming schema '{schema}', as {second}")]
    AmbiguousSnapshotName {
        name: String,
        schema: String,
        first: NaiveDateTime,
        second: NaiveDateTime,
    },

    /// Source and destination share no snapshot.
    #[error("No incremental base on dataset '{dataset}' and replication from scratch is not allowed")]
    NoIncrementalBase { dataset: String },

    /// Destination has no snapshots but holds a non-trivial amount of data.
    #[error("Target dataset '{dataset}' does not have snapshots but has data ({used} bytes used) and replication from scratch is not allowed. Refusing to overwrite existing data.")]
    TargetHasData { dataset: String, used: u64 },

    /// Destination exists with an incompatible dataset type.
    #[error("Source '{src}' is a {src_type}, but target '{dst}' already exists and is a {dst_type}")]
    TargetTypeMismatch {
        src: String,
        src_type: String,
        dst: String,
        dst_type: String,
    },

    /// Destination encryption relationship is incompatible with the task.
    #[error("Encryption error: {0}")]
    EncryptionMismatch(String),

    /// Destination readonly policy violated.
    #[error("Readonly policy violation: {0}")]
    ReadonlyViolation(String),

    /// Transfer primitive failed (killed process, checksum mismatch, signal).
    #[error("Transfer error ({dataset}): {message}")]
    Transfer { dataset: String, message: String },

    /// Dataset does not exist.
    #[error("Dataset '{0}' does not exist")]
    DatasetNotFound(String),

    /// Resume token stopped advancing while a transfer was in flight.
    #[error("Replication of '{dataset}' is stuck: resume token did not change in {polls} consecutive checks")]
    StuckTransfer { dataset: String, polls: usize },

    /// Destination is mid-resume and cannot accept the next increment yet.
    #[error("destination '{dataset}' contains partially-complete state from \"zfs receive -s\"")]
    PartiallyCompleteState { dataset: String },

    /// External command exceeded its scoped timeout.
    #[error("Timed out after {timeout:?} while running {operation}")]
    Timeout { operation: String, timeout: Duration },

    /// External command failed for a reason we do not classify.
    #[error("Command error ({operation}): {message}")]
    Command { operation: String, message: String },

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transfer error.
    pub fn transfer(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transfer {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    /// Create a command error.
    pub fn command(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error consumes the task retry budget and is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transfer { .. } => !self.is_partially_complete_state(),
            Self::DatasetNotFound(_) => true,
            Self::StuckTransfer { .. } => true,
            Self::PartiallyCompleteState { .. } => false, // Own backoff
            Self::Config(_)
            | Self::InvalidNamingSchema { .. }
            | Self::AmbiguousSnapshotName { .. }
            | Self::NoIncrementalBase { .. }
            | Self::TargetHasData { .. }
            | Self::TargetTypeMismatch { .. }
            | Self::EncryptionMismatch(_)
            | Self::ReadonlyViolation(_) => false,
            Self::Timeout { .. } | Self::Command { .. } => false,
            Self::InvalidState { .. } | Self::Shutdown | Self::Internal(_) => false,
        }
    }

    /// Check if this is a configuration error (fatal for the task, never retried).
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidNamingSchema { .. }
                | Self::AmbiguousSnapshotName { .. }
                | Self::NoIncrementalBase { .. }
                | Self::TargetHasData { .. }
                | Self::TargetTypeMismatch { .. }
                | Self::EncryptionMismatch(_)
                | Self::ReadonlyViolation(_)
        )
    }

    /// Check if the destination reported partially-complete state.
    ///
    /// Transports usually surface this as a plain transfer message, so the
    /// marker substring is matched as well as the dedicated variant.
    pub fn is_partially_complete_state(&self) -> bool {
        match self {
            Self::PartiallyCompleteState { .. } => true,
            Self::Transfer { message, .. } => message.contains(PARTIALLY_COMPLETE_STATE_MARKER),
            _ => false,
        }
    }

    /// Check if the failed attempt may have been a stuck transfer.
    pub fn is_possibly_stuck(&self) -> bool {
        matches!(self, Self::StuckTransfer { .. })
    }
}
