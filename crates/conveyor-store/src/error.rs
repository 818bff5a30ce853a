//! Store Error Types
//!
//! This module defines all error types that can occur during lease and
//! checkpoint store operations.
//!
//! ## Error Categories
//!
//! ### Coordination Errors
//! - `Conflict`: a compare-and-set lost - another host holds or just took the lease
//! - `Fenced`: a checkpoint write presented a stale fencing token
//!
//! ### Availability Errors
//! - `Transient`: the backend failed in a retryable way (network, timeout)
//!
//! ### Data Errors
//! - `NotFound`: no lease record exists for the partition
//! - `Database`: the SQLite backend failed
//! - `Serialization`: lease/checkpoint (de)serialization failed

use thiserror::Error;

/// Convenience type alias for `Result<T, StoreError>`.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The compare-and-set failed: another host owns a live lease, or the
    /// presented token is no longer current.
    ///
    /// Callers treat this as "not acquired" and move on; the partition
    /// manager will see the new owner on its next scan.
    #[error("Lease conflict on partition {partition_id}: {detail}")]
    Conflict {
        partition_id: String,
        detail: String,
    },

    /// A checkpoint write was rejected because the lease token is stale.
    ///
    /// The former owner must stop checkpointing; the lease has moved.
    #[error("Checkpoint fenced on partition {partition_id}")]
    Fenced { partition_id: String },

    /// No lease record exists for the partition.
    #[error("Lease not found for partition {0}")]
    NotFound(String),

    /// Retryable backend failure.
    #[error("Transient store failure: {0}")]
    Transient(String),

    /// SQLite backend failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Lease/checkpoint (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the operation may be retried without any state change.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Whether the error means the caller no longer holds the lease.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Fenced { .. })
    }
}
