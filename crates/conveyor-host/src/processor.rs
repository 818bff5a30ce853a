//! Event Processor Contract
//!
//! The user-facing lifecycle: a processor is created per owned partition,
//! sees `open` once, then batches through `on_events` (never concurrently
//! for the same partition), then `close` exactly once with the reason
//! ownership ended. `on_error` is informational.
//!
//! `PartitionContext` is the processor's view of its partition: identity
//! accessors plus checkpointing, fenced by the current lease token.

use crate::error::{HostError, Result};
use conveyor_core::{Checkpoint, EventData};
use conveyor_store::{CheckpointStore, Lease};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Why a partition pump is closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The host is unregistering.
    Shutdown,
    /// Ownership moved to another host (steal, expiry, or renewal
    /// conflict).
    LeaseLost,
    /// The processor failed in `open` or `on_events`.
    ProcessorFailure,
}

/// Errors raised by user processor code.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied per-partition event processor.
#[async_trait]
pub trait EventProcessor: Send {
    /// Called once before the first batch. A failure aborts pump startup.
    async fn open(&mut self, context: &PartitionContext) -> std::result::Result<(), ProcessorError>;

    /// Called with each batch, in broker order. The batch is empty only
    /// when `invoke_on_timeout` is enabled. Never invoked concurrently for
    /// the same partition.
    async fn on_events(
        &mut self,
        context: &PartitionContext,
        events: Vec<EventData>,
    ) -> std::result::Result<(), ProcessorError>;

    /// Called exactly once per successful `open`, after the last
    /// `on_events` has completed.
    async fn close(&mut self, context: &PartitionContext, reason: CloseReason);

    /// Informational error report; the pump's fate is decided elsewhere.
    async fn on_error(&mut self, context: &PartitionContext, error: &HostError) {
        let _ = (context, error);
    }
}

/// Creates a processor for each partition a host comes to own.
#[async_trait]
pub trait EventProcessorFactory: Send + Sync {
    async fn create(
        &self,
        context: &PartitionContext,
    ) -> std::result::Result<Box<dyn EventProcessor>, ProcessorError>;
}

/// A processor's view of its partition.
///
/// Cheap to share; the pump and the processor hold the same instance
/// through an `Arc`.
pub struct PartitionContext {
    host_name: String,
    event_hub_path: String,
    consumer_group: String,
    partition_id: String,
    /// Current lease, shared with the renewal task so checkpoints always
    /// carry the freshest token.
    lease: Arc<RwLock<Lease>>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    /// Set when the pump enters Stopping; checkpoints are refused from then
    /// on.
    stopping: AtomicBool,
    /// Offset and sequence of the most recently delivered event.
    last_event: RwLock<Option<(u64, u64)>>,
}

impl PartitionContext {
    pub(crate) fn new(
        host_name: String,
        event_hub_path: String,
        consumer_group: String,
        partition_id: String,
        lease: Arc<RwLock<Lease>>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            host_name,
            event_hub_path,
            consumer_group,
            partition_id,
            lease,
            checkpoint_store,
            stopping: AtomicBool::new(false),
            last_event: RwLock::new(None),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn event_hub_path(&self) -> &str {
        &self.event_hub_path
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    /// Current owner recorded on the lease.
    pub async fn owner(&self) -> String {
        self.lease.read().await.owner.clone()
    }

    /// Checkpoint at the most recently delivered event.
    pub async fn checkpoint(&self) -> Result<()> {
        let last = *self.last_event.read().await;
        match last {
            Some((offset, sequence_number)) => {
                self.checkpoint_at(offset, sequence_number).await
            }
            None => Err(HostError::CheckpointRejected {
                partition_id: self.partition_id.clone(),
                reason: "no events delivered yet".to_string(),
            }),
        }
    }

    /// Checkpoint at an explicit offset and sequence number.
    pub async fn checkpoint_at(&self, offset: u64, sequence_number: u64) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(HostError::CheckpointRejected {
                partition_id: self.partition_id.clone(),
                reason: "pump is stopping".to_string(),
            });
        }

        let lease = self.lease.read().await.clone();
        let checkpoint = Checkpoint::new(self.partition_id.clone(), offset, sequence_number);
        self.checkpoint_store
            .update_checkpoint(&lease, &checkpoint)
            .await?;

        debug!(
            host = %self.host_name,
            partition = %self.partition_id,
            offset,
            sequence_number,
            "Checkpoint committed"
        );
        Ok(())
    }

    /// Mark the context stopping; later checkpoints are refused.
    pub(crate) fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Record the tail of a delivered batch so `checkpoint()` knows where
    /// the processor is.
    pub(crate) async fn record_delivery(&self, events: &[EventData]) {
        if let Some(last) = events.last() {
            *self.last_event.write().await = Some((last.offset, last.sequence_number));
        }
    }
}
