//! Partition Pump
//!
//! The per-partition actor on the owning host: reads batches from the
//! broker receiver and dispatches them to the user event processor, one
//! batch at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! Starting ──open receiver──▶ Running ──stop()──▶ Stopping ──drain──▶ Stopped
//!    │                           │
//!    └──error──▶ Failed ◀──error─┘
//! ```
//!
//! Starting reads the checkpoint and opens the receiver at the recorded
//! offset (or the configured initial position), threading the lease epoch
//! through as the broker receiver epoch. Stopping never interrupts an
//! in-flight `on_events`; it finishes, then `close` runs exactly once with
//! the reason. Checkpoints are refused from the moment stopping begins.

use crate::error::HostError;
use crate::options::HostOptions;
use crate::processor::{
    CloseReason, EventProcessor, EventProcessorFactory, PartitionContext,
};
use conveyor_core::{ReceiveError, Receiver, ReceiverFactory};
use conveyor_store::{CheckpointStore, Lease};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pump lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl PumpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PumpState::Stopped | PumpState::Failed)
    }
}

/// Everything a pump needs to run one partition.
pub(crate) struct PumpArgs {
    pub host_name: String,
    pub event_hub_path: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub options: HostOptions,
    pub lease: Arc<RwLock<Lease>>,
    pub receiver_factory: Arc<dyn ReceiverFactory>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub processor_factory: Arc<dyn EventProcessorFactory>,
}

/// Handle to a running partition pump.
pub struct PartitionPump {
    partition_id: String,
    context: Arc<PartitionContext>,
    state_rx: watch::Receiver<PumpState>,
    stop_tx: watch::Sender<Option<CloseReason>>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionPump {
    /// Spawn the pump task for a freshly owned partition.
    pub(crate) fn start(args: PumpArgs) -> Self {
        let partition_id = args.partition_id.clone();
        let context = Arc::new(PartitionContext::new(
            args.host_name.clone(),
            args.event_hub_path.clone(),
            args.consumer_group.clone(),
            args.partition_id.clone(),
            Arc::clone(&args.lease),
            Arc::clone(&args.checkpoint_store),
        ));

        let (state_tx, state_rx) = watch::channel(PumpState::Starting);
        let (stop_tx, stop_rx) = watch::channel(None);

        let task = PumpTask {
            context: Arc::clone(&context),
            options: args.options,
            lease: args.lease,
            receiver_factory: args.receiver_factory,
            checkpoint_store: args.checkpoint_store,
            processor_factory: args.processor_factory,
            state_tx,
            stop_rx,
        };
        let handle = tokio::spawn(task.run());

        Self {
            partition_id,
            context,
            state_rx,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn context(&self) -> &Arc<PartitionContext> {
        &self.context
    }

    pub fn state(&self) -> PumpState {
        *self.state_rx.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request a stop. The first reason wins; later calls are ignored.
    pub fn stop(&self, reason: CloseReason) {
        self.stop_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// The reason `stop` was called with, if it was.
    pub fn stop_reason(&self) -> Option<CloseReason> {
        *self.stop_tx.borrow()
    }

    /// Wait for the pump task to finish.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Abandon the pump without waiting (drain timeout expired).
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Wait until the pump reaches a terminal state.
    pub async fn wait_terminal(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            if state_rx.borrow().is_terminal() {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

enum PumpExit {
    /// Graceful stop with the reason to hand to `close`.
    Stopped(CloseReason),
    /// The pump failed; `on_error` then `close(ProcessorFailure)`.
    Failed(HostError),
}

struct PumpTask {
    context: Arc<PartitionContext>,
    options: HostOptions,
    lease: Arc<RwLock<Lease>>,
    receiver_factory: Arc<dyn ReceiverFactory>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    processor_factory: Arc<dyn EventProcessorFactory>,
    state_tx: watch::Sender<PumpState>,
    stop_rx: watch::Receiver<Option<CloseReason>>,
}

impl PumpTask {
    async fn run(mut self) {
        let partition_id = self.context.partition_id().to_string();

        let (receiver, processor) = match self.start_up().await {
            Ok(started) => started,
            Err((processor, e)) => {
                error!(
                    host = %self.context.host_name(),
                    partition = %partition_id,
                    error = %e,
                    "Pump failed to start"
                );
                self.context.begin_stopping();
                if let Some(mut processor) = processor {
                    // `open` did not succeed, so there is no matching
                    // `close`; the failure is only reported.
                    processor.on_error(&self.context, &e).await;
                }
                self.state_tx.send_replace(PumpState::Failed);
                return;
            }
        };

        self.state_tx.send_replace(PumpState::Running);
        info!(
            host = %self.context.host_name(),
            partition = %partition_id,
            "Partition pump running"
        );

        self.pump(receiver, processor).await;
    }

    /// Starting: checkpoint → receiver → processor → `open`.
    ///
    /// On failure returns the processor (if one was created) so the caller
    /// can report the error to it.
    async fn start_up(
        &mut self,
    ) -> Result<(Box<dyn Receiver>, Box<dyn EventProcessor>), (Option<Box<dyn EventProcessor>>, HostError)>
    {
        let partition_id = self.context.partition_id().to_string();

        let checkpoint = self
            .checkpoint_store
            .get_checkpoint(&partition_id)
            .await
            .map_err(|e| (None, HostError::Store(e)))?;

        let position = match &checkpoint {
            Some(cp) => {
                debug!(
                    partition = %partition_id,
                    offset = cp.offset,
                    sequence = cp.sequence_number,
                    "Resuming from checkpoint"
                );
                cp.resume_position()
            }
            None => self.options.initial_position,
        };

        let epoch = self.lease.read().await.epoch;
        let receiver = self
            .receiver_factory
            .open(&partition_id, position, self.options.prefetch_count, Some(epoch))
            .await
            .map_err(|e| (None, HostError::Receive(e)))?;

        let mut processor = self
            .processor_factory
            .create(&self.context)
            .await
            .map_err(|e| (None, HostError::Processor(e.to_string())))?;

        if let Err(e) = processor.open(&self.context).await {
            return Err((Some(processor), HostError::Processor(e.to_string())));
        }

        Ok((receiver, processor))
    }

    /// Running: receive and dispatch until stopped or failed, then drain
    /// and close.
    async fn pump(
        mut self,
        mut receiver: Box<dyn Receiver>,
        mut processor: Box<dyn EventProcessor>,
    ) {
        let partition_id = self.context.partition_id().to_string();

        let exit = loop {
            if let Some(reason) = *self.stop_rx.borrow() {
                break PumpExit::Stopped(reason);
            }

            tokio::select! {
                _ = self.stop_rx.changed() => continue,
                received = receiver.receive(self.options.max_batch_size, self.options.receive_timeout) => {
                    match received {
                        Ok(events) => {
                            if events.is_empty() && !self.options.invoke_on_timeout {
                                continue;
                            }
                            self.context.record_delivery(&events).await;
                            if let Err(e) = processor.on_events(&self.context, events).await {
                                break PumpExit::Failed(HostError::Processor(e.to_string()));
                            }
                        }
                        Err(ReceiveError::Disconnected { current, superseding }) => {
                            warn!(
                                partition = %partition_id,
                                current,
                                superseding,
                                "Receiver superseded by a higher epoch"
                            );
                            break PumpExit::Stopped(CloseReason::LeaseLost);
                        }
                        Err(ReceiveError::Transient(detail)) => {
                            warn!(
                                partition = %partition_id,
                                detail = %detail,
                                "Transient receive failure"
                            );
                        }
                        Err(e) => break PumpExit::Failed(HostError::Receive(e)),
                    }
                }
            }
        };

        // No checkpoints once stopping has begun, and no further receives.
        self.context.begin_stopping();
        if let Err(e) = receiver.close().await {
            debug!(partition = %partition_id, error = %e, "Receiver close failed");
        }

        match exit {
            PumpExit::Stopped(reason) => {
                self.state_tx.send_replace(PumpState::Stopping);
                processor.close(&self.context, reason).await;
                self.state_tx.send_replace(PumpState::Stopped);
                info!(
                    host = %self.context.host_name(),
                    partition = %partition_id,
                    reason = ?reason,
                    "Partition pump stopped"
                );
            }
            PumpExit::Failed(e) => {
                error!(
                    host = %self.context.host_name(),
                    partition = %partition_id,
                    error = %e,
                    "Partition pump failed"
                );
                processor.on_error(&self.context, &e).await;
                processor.close(&self.context, CloseReason::ProcessorFailure).await;
                self.state_tx.send_replace(PumpState::Failed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conveyor_core::{EventData, EventPosition, InMemoryBroker};
    use conveyor_store::{InMemoryLeaseStore, LeaseStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Call {
        Opened,
        Batch(Vec<u64>),
        Closed(CloseReason),
        Error(String),
    }

    struct RecordingProcessor {
        calls: mpsc::UnboundedSender<Call>,
        checkpoint_batches: bool,
        fail_open: bool,
        fail_on_events: bool,
    }

    #[async_trait::async_trait]
    impl EventProcessor for RecordingProcessor {
        async fn open(
            &mut self,
            _context: &PartitionContext,
        ) -> std::result::Result<(), crate::processor::ProcessorError> {
            if self.fail_open {
                return Err("open refused".into());
            }
            let _ = self.calls.send(Call::Opened);
            Ok(())
        }

        async fn on_events(
            &mut self,
            context: &PartitionContext,
            events: Vec<EventData>,
        ) -> std::result::Result<(), crate::processor::ProcessorError> {
            if self.fail_on_events {
                return Err("processing exploded".into());
            }
            let _ = self
                .calls
                .send(Call::Batch(events.iter().map(|e| e.sequence_number).collect()));
            if self.checkpoint_batches && !events.is_empty() {
                context.checkpoint().await?;
            }
            Ok(())
        }

        async fn close(&mut self, _context: &PartitionContext, reason: CloseReason) {
            let _ = self.calls.send(Call::Closed(reason));
        }

        async fn on_error(&mut self, _context: &PartitionContext, error: &HostError) {
            let _ = self.calls.send(Call::Error(error.to_string()));
        }
    }

    struct RecordingFactory {
        calls: mpsc::UnboundedSender<Call>,
        checkpoint_batches: bool,
        fail_open: bool,
        fail_on_events: bool,
    }

    #[async_trait::async_trait]
    impl EventProcessorFactory for RecordingFactory {
        async fn create(
            &self,
            _context: &PartitionContext,
        ) -> std::result::Result<Box<dyn EventProcessor>, crate::processor::ProcessorError>
        {
            Ok(Box::new(RecordingProcessor {
                calls: self.calls.clone(),
                checkpoint_batches: self.checkpoint_batches,
                fail_open: self.fail_open,
                fail_on_events: self.fail_on_events,
            }))
        }
    }

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryLeaseStore>,
        lease: Arc<RwLock<Lease>>,
        calls: mpsc::UnboundedReceiver<Call>,
        pump: PartitionPump,
    }

    async fn start_pump(fail_open: bool, fail_on_events: bool, checkpoint_batches: bool) -> Fixture {
        let broker = Arc::new(InMemoryBroker::new(1));
        let store = Arc::new(InMemoryLeaseStore::new());
        let unowned = store.create_lease_if_not_exists("0").await.unwrap();
        let held = store
            .acquire(&unowned, "host-a", Duration::from_secs(30))
            .await
            .unwrap();
        let lease = Arc::new(RwLock::new(held));

        let (calls_tx, calls) = mpsc::unbounded_channel();
        let options = HostOptions {
            receive_timeout: Duration::from_millis(50),
            initial_position: EventPosition::Start,
            ..Default::default()
        };

        let pump = PartitionPump::start(PumpArgs {
            host_name: "host-a".to_string(),
            event_hub_path: "telemetry".to_string(),
            consumer_group: "$default".to_string(),
            partition_id: "0".to_string(),
            options,
            lease: Arc::clone(&lease),
            receiver_factory: Arc::clone(&broker) as Arc<dyn ReceiverFactory>,
            checkpoint_store: Arc::clone(&store) as Arc<dyn CheckpointStore>,
            processor_factory: Arc::new(RecordingFactory {
                calls: calls_tx,
                checkpoint_batches,
                fail_open,
                fail_on_events,
            }),
        });

        Fixture {
            broker,
            store,
            lease,
            calls,
            pump,
        }
    }

    async fn next_call(calls: &mut mpsc::UnboundedReceiver<Call>) -> Call {
        tokio::time::timeout(Duration::from_secs(5), calls.recv())
            .await
            .expect("processor call expected")
            .expect("call channel open")
    }

    #[tokio::test]
    async fn test_delivers_events_in_order() {
        let mut fx = start_pump(false, false, false).await;
        assert!(matches!(next_call(&mut fx.calls).await, Call::Opened));

        fx.broker.publish("0", "e1");
        fx.broker.publish("0", "e2");
        fx.broker.publish("0", "e3");

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match next_call(&mut fx.calls).await {
                Call::Batch(seqs) => seen.extend(seqs),
                other => panic!("unexpected call {other:?}"),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);

        fx.pump.stop(CloseReason::Shutdown);
        fx.pump.join().await;
    }

    #[tokio::test]
    async fn test_stop_closes_exactly_once_with_reason() {
        let mut fx = start_pump(false, false, false).await;
        assert!(matches!(next_call(&mut fx.calls).await, Call::Opened));

        fx.pump.stop(CloseReason::Shutdown);
        // A second stop with a different reason is ignored.
        fx.pump.stop(CloseReason::LeaseLost);
        fx.pump.join().await;

        assert_eq!(fx.pump.state(), PumpState::Stopped);
        assert!(matches!(
            next_call(&mut fx.calls).await,
            Call::Closed(CloseReason::Shutdown)
        ));
        assert!(fx.calls.try_recv().is_err(), "close fires exactly once");
    }

    #[tokio::test]
    async fn test_processor_failure_reports_then_closes() {
        let mut fx = start_pump(false, true, false).await;
        assert!(matches!(next_call(&mut fx.calls).await, Call::Opened));

        fx.broker.publish("0", "boom");
        fx.pump.wait_terminal().await;
        assert_eq!(fx.pump.state(), PumpState::Failed);

        assert!(matches!(next_call(&mut fx.calls).await, Call::Error(_)));
        assert!(matches!(
            next_call(&mut fx.calls).await,
            Call::Closed(CloseReason::ProcessorFailure)
        ));
    }

    #[tokio::test]
    async fn test_open_failure_fails_without_close() {
        let mut fx = start_pump(true, false, false).await;

        fx.pump.wait_terminal().await;
        assert_eq!(fx.pump.state(), PumpState::Failed);

        // Only the error report; no Opened, no Closed.
        assert!(matches!(next_call(&mut fx.calls).await, Call::Error(_)));
        assert!(fx.calls.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resumes_after_checkpoint() {
        let mut fx = start_pump(false, false, true).await;
        assert!(matches!(next_call(&mut fx.calls).await, Call::Opened));
        fx.broker.publish("0", "e1");
        fx.broker.publish("0", "e2");

        // Both events delivered and checkpointed per batch.
        let mut seen = Vec::new();
        while seen.len() < 2 {
            match next_call(&mut fx.calls).await {
                Call::Batch(seqs) => seen.extend(seqs),
                other => panic!("unexpected call {other:?}"),
            }
        }
        fx.pump.stop(CloseReason::Shutdown);
        fx.pump.join().await;

        // Restart a fresh pump against the same broker and store.
        let current = fx.store.get_all_leases().await.unwrap().remove(0);
        let held = fx
            .store
            .acquire(&current, "host-a", Duration::from_secs(30))
            .await
            .unwrap();
        *fx.lease.write().await = held.clone();

        let (calls_tx, mut calls) = mpsc::unbounded_channel();
        let mut pump = PartitionPump::start(PumpArgs {
            host_name: "host-a".to_string(),
            event_hub_path: "telemetry".to_string(),
            consumer_group: "$default".to_string(),
            partition_id: "0".to_string(),
            options: HostOptions {
                receive_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            lease: Arc::new(RwLock::new(held)),
            receiver_factory: Arc::clone(&fx.broker) as Arc<dyn ReceiverFactory>,
            checkpoint_store: Arc::clone(&fx.store) as Arc<dyn CheckpointStore>,
            processor_factory: Arc::new(RecordingFactory {
                calls: calls_tx,
                checkpoint_batches: false,
                fail_open: false,
                fail_on_events: false,
            }),
        });

        assert!(matches!(next_call(&mut calls).await, Call::Opened));
        // e1/e2 were checkpointed; only e3 may be delivered.
        fx.broker.publish("0", "e3");
        match next_call(&mut calls).await {
            Call::Batch(seqs) => assert_eq!(seqs, vec![2], "no replay of checkpointed events"),
            other => panic!("unexpected call {other:?}"),
        }

        pump.stop(CloseReason::Shutdown);
        pump.join().await;
    }

    #[tokio::test]
    async fn test_higher_epoch_stops_pump_as_lease_lost() {
        let mut fx = start_pump(false, false, false).await;
        assert!(matches!(next_call(&mut fx.calls).await, Call::Opened));

        // A competing receiver with a higher epoch takes the partition.
        let _thief = fx
            .broker
            .open("0", EventPosition::Start, 300, Some(99))
            .await
            .unwrap();

        fx.pump.wait_terminal().await;
        assert_eq!(fx.pump.state(), PumpState::Stopped);
        assert!(matches!(
            next_call(&mut fx.calls).await,
            Call::Closed(CloseReason::LeaseLost)
        ));
    }

    #[tokio::test]
    async fn test_empty_batches_only_with_invoke_on_timeout() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let store = Arc::new(InMemoryLeaseStore::new());
        let unowned = store.create_lease_if_not_exists("0").await.unwrap();
        let held = store
            .acquire(&unowned, "host-a", Duration::from_secs(30))
            .await
            .unwrap();

        let (calls_tx, mut calls) = mpsc::unbounded_channel();
        let mut pump = PartitionPump::start(PumpArgs {
            host_name: "host-a".to_string(),
            event_hub_path: "telemetry".to_string(),
            consumer_group: "$default".to_string(),
            partition_id: "0".to_string(),
            options: HostOptions {
                receive_timeout: Duration::from_millis(20),
                invoke_on_timeout: true,
                ..Default::default()
            },
            lease: Arc::new(RwLock::new(held)),
            receiver_factory: Arc::clone(&broker) as Arc<dyn ReceiverFactory>,
            checkpoint_store: Arc::clone(&store) as Arc<dyn CheckpointStore>,
            processor_factory: Arc::new(RecordingFactory {
                calls: calls_tx,
                checkpoint_batches: false,
                fail_open: false,
                fail_on_events: false,
            }),
        });

        assert!(matches!(next_call(&mut calls).await, Call::Opened));
        match next_call(&mut calls).await {
            Call::Batch(seqs) => assert!(seqs.is_empty(), "timeout delivers an empty batch"),
            other => panic!("unexpected call {other:?}"),
        }

        pump.stop(CloseReason::Shutdown);
        pump.join().await;
    }

    #[tokio::test]
    async fn test_no_checkpoint_after_stopping() {
        let mut fx = start_pump(false, false, false).await;
        assert!(matches!(next_call(&mut fx.calls).await, Call::Opened));

        fx.broker.publish("0", "e1");
        match next_call(&mut fx.calls).await {
            Call::Batch(_) => {}
            other => panic!("unexpected call {other:?}"),
        }

        fx.pump.stop(CloseReason::Shutdown);
        fx.pump.join().await;

        // The context refuses late checkpoints from a retained reference.
        let err = fx.pump.context().checkpoint().await.err().unwrap();
        assert!(matches!(err, HostError::CheckpointRejected { .. }));
        assert!(
            fx.store.get_checkpoint("0").await.unwrap().is_none(),
            "no checkpoint may land after stopping"
        );
    }
}
