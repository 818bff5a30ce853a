//! Receiver Contracts
//!
//! The broker-facing seam of the coordination engine. The partition pump
//! consumes these traits; a real broker client and the in-memory broker both
//! implement them.
//!
//! ## Epoch Receivers
//!
//! `ReceiverFactory::open` accepts an optional epoch. The host threads the
//! lease epoch through here, so a broker that supports epoch receivers will
//! disconnect a stale owner's receiver the moment a higher-epoch receiver
//! opens on the same partition.

use crate::position::EventPosition;
use crate::record::EventData;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ReceiveError>`.
pub type Result<T> = std::result::Result<T, ReceiveError>;

/// Errors surfaced by the receiver contract.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The partition does not exist on this broker.
    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    /// A receiver with a higher epoch took over the partition.
    ///
    /// The current owner must stop reading; its lease has been (or is about
    /// to be) stolen.
    #[error("Receiver disconnected: epoch {current} superseded by {superseding}")]
    Disconnected { current: u64, superseding: u64 },

    /// The receiver (or its connection) was closed.
    #[error("Receiver closed")]
    Closed,

    /// Transient broker failure; receiving may be retried.
    #[error("Transient receive failure: {0}")]
    Transient(String),
}

/// An open receiver on a single partition.
///
/// `receive` returns events in broker order. An empty batch means the
/// timeout elapsed with nothing to deliver.
#[async_trait]
pub trait Receiver: Send {
    async fn receive(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<EventData>>;

    async fn close(&mut self) -> Result<()>;
}

/// Factory for opening partition receivers.
///
/// Implemented by the broker client. `partition_ids` reports the fixed
/// partition set of the event hub; the partition manager caches it for the
/// lifetime of the host.
#[async_trait]
pub trait ReceiverFactory: Send + Sync {
    /// The partition identifiers of the event hub, in broker order.
    async fn partition_ids(&self) -> Result<Vec<String>>;

    /// Open a receiver on `partition_id` starting at `position`.
    ///
    /// `epoch`, when provided, requests an epoch receiver: the broker grants
    /// the partition to the highest epoch and disconnects lower ones.
    async fn open(
        &self,
        partition_id: &str,
        position: EventPosition,
        prefetch_count: u32,
        epoch: Option<u64>,
    ) -> Result<Box<dyn Receiver>>;
}
