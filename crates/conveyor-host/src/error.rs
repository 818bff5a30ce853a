//! Error types for the event processor host.
//!
//! ## Error Categories
//!
//! ### Lifecycle Errors
//! - `AlreadyRegistered`: `register()` called on a registered host
//! - `Unregistered`: `register()` called after `unregister()`
//! - `InvalidOptions`: option validation failed at build time
//!
//! ### Runtime Errors
//! - `CheckpointRejected`: checkpoint attempted after the pump began
//!   stopping, or before any event was delivered
//! - `Processor`: the user event processor failed
//!
//! ### Wrapped Errors
//! - `Store`: lease/checkpoint store operation failed
//! - `Receive`: broker receiver operation failed
//! - `Join`: background task join failed
//!
//! Registration failures are returned synchronously from `register()`;
//! runtime failures are surfaced through the processor's `on_error`
//! callback while the control loop keeps running.

use conveyor_core::ReceiveError;
use conveyor_store::StoreError;
use thiserror::Error;

/// Convenience type alias for `Result<T, HostError>`.
pub type Result<T> = std::result::Result<T, HostError>;

/// Comprehensive error type for host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// `register()` called while the host is already registered.
    #[error("Host already registered")]
    AlreadyRegistered,

    /// `register()` called after `unregister()`. A host instance cannot be
    /// reused; create a new one.
    #[error("Host has been unregistered")]
    Unregistered,

    /// Host options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// A checkpoint was refused.
    ///
    /// Either the pump already began stopping (writes from a stale owner
    /// must not land), or no event has been delivered yet so there is
    /// nothing to checkpoint.
    #[error("Checkpoint rejected for partition {partition_id}: {reason}")]
    CheckpointRejected {
        partition_id: String,
        reason: String,
    },

    /// The user event processor failed in `open` or `on_events`.
    #[error("Event processor failed: {0}")]
    Processor(String),

    /// Lease or checkpoint store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker receiver operation failed.
    #[error("Receive error: {0}")]
    Receive(#[from] ReceiveError),

    /// Background task join failed.
    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
