//! Conveyor Store - Lease and Checkpoint Persistence
//!
//! This crate defines the persistence contracts the coordination engine runs
//! on, and two backends:
//!
//! - **LeaseStore**: fenced, compare-and-set lease operations
//! - **CheckpointStore**: per-partition progress records, fenced by the
//!   current lease token
//! - **InMemoryLeaseStore**: process-local CAS backend with transient-fault
//!   injection, used by tests
//! - **SqliteLeaseStore**: embedded SQLite backend for single-box
//!   deployments
//!
//! ## The CAS
//!
//! A single compare primitive - the fencing token - carries the whole
//! protocol. Acquire succeeds against an unowned or expired lease, or when
//! the caller presents the currently stored token (that is the steal path:
//! the caller proves it acted on an up-to-date read, and the token rotates
//! on success so racing stealers serialize). Renew, release, lease updates
//! and checkpoint writes all require the matching token, which is both
//! liveness (stale owners cannot extend) and fencing (stale owners cannot
//! checkpoint).

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{Result, StoreError};
pub use memory::InMemoryLeaseStore;
pub use sqlite::SqliteLeaseStore;
pub use types::{current_timestamp_ms, Lease};

use async_trait::async_trait;
use conveyor_core::Checkpoint;
use std::time::Duration;

/// Lease persistence contract.
///
/// All operations may fail with `StoreError::Transient` (retryable) or
/// `StoreError::Conflict` (the CAS lost). Implementations must be Send +
/// Sync; they are shared across tasks as `Arc<dyn LeaseStore>`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Idempotently create the backing container.
    async fn ensure_store(&self) -> Result<()>;

    /// Return the lease record for `partition_id`, creating an unowned one
    /// if none exists yet. First host to start typically does this for the
    /// whole partition set.
    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<Lease>;

    /// Snapshot of all lease records. No ordering guarantee.
    async fn get_all_leases(&self) -> Result<Vec<Lease>>;

    /// Attempt to take ownership of a lease for `owner`.
    ///
    /// Succeeds if the stored lease is unowned or expired, or if `lease`
    /// carries the currently stored token (the steal path). On success the
    /// returned lease has a fresh token, `owner` set, the epoch bumped, and
    /// `expires_at = now + ttl`. Fails with `Conflict` when another owner
    /// holds a live lease and the token does not match.
    async fn acquire(&self, lease: &Lease, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Extend the expiry of a held lease. Requires the current token; a
    /// `Conflict` means the lease was stolen.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Clear ownership and invalidate the token. Requires the current
    /// token; releasing an already-stolen lease is a `Conflict` the caller
    /// may ignore.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Token-gated write of the owner-mutable lease fields. Fencing fields
    /// (token, epoch, expiry) are never changed by this operation.
    async fn update_lease(&self, lease: &Lease) -> Result<Lease>;
}

/// Checkpoint persistence contract.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed checkpoint for a partition, if any.
    async fn get_checkpoint(&self, partition_id: &str) -> Result<Option<Checkpoint>>;

    /// Commit a checkpoint. Rejected with `Fenced` unless `lease` carries
    /// the currently valid token for the partition.
    async fn update_checkpoint(&self, lease: &Lease, checkpoint: &Checkpoint) -> Result<()>;
}
