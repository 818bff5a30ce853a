//! In-Memory Broker
//!
//! An in-process implementation of the receiver contract, used by tests and
//! local development. Each partition is an ordered log guarded by a mutex;
//! receivers scan forward from their starting position and park on a
//! `Notify` when caught up.
//!
//! ## Epoch Precedence
//!
//! The broker honors epoch receivers: opening with an epoch greater than or
//! equal to the current holder's takes the partition, and the superseded
//! receiver observes `ReceiveError::Disconnected` on its next receive.
//! Opening with a lower epoch is rejected immediately.

use crate::position::EventPosition;
use crate::receiver::{ReceiveError, Receiver, ReceiverFactory, Result};
use crate::record::EventData;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Per-event wire overhead added to the offset progression, so offsets look
/// like byte positions rather than indexes.
const EVENT_FRAME_OVERHEAD: u64 = 16;

#[derive(Default)]
struct EpochState {
    /// Current epoch holder, if any, and the generation it was granted.
    holder: Option<(u64, u64)>,
    next_generation: u64,
}

struct PartitionLog {
    events: Mutex<Vec<EventData>>,
    next_offset: Mutex<u64>,
    epoch: Mutex<EpochState>,
    notify: Notify,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            next_offset: Mutex::new(0),
            epoch: Mutex::new(EpochState::default()),
            notify: Notify::new(),
        }
    }

    fn append(&self, body: Bytes, properties: HashMap<String, String>) -> EventData {
        let mut events = self.events.lock().unwrap();
        let mut next_offset = self.next_offset.lock().unwrap();

        let offset = *next_offset;
        *next_offset += body.len() as u64 + EVENT_FRAME_OVERHEAD;

        let mut event = EventData::new(
            offset,
            events.len() as u64,
            current_timestamp_ms(),
            body,
        );
        event.properties = properties;
        events.push(event.clone());
        drop(events);
        drop(next_offset);

        self.notify.notify_waiters();
        event
    }

    fn last_sequence(&self) -> Option<u64> {
        let events = self.events.lock().unwrap();
        events.last().map(|e| e.sequence_number)
    }

    /// Grant the partition to an epoch receiver. Returns the generation, or
    /// an error if a higher epoch already holds it.
    fn grant(&self, epoch: u64) -> Result<u64> {
        let mut state = self.epoch.lock().unwrap();
        if let Some((current, _)) = state.holder {
            if epoch < current {
                return Err(ReceiveError::Disconnected {
                    current: epoch,
                    superseding: current,
                });
            }
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.holder = Some((epoch, generation));
        // Wake a superseded receiver parked in receive() so it observes the
        // takeover instead of waiting out its timeout.
        self.notify.notify_waiters();
        Ok(generation)
    }

    /// Check that `generation` still holds the partition.
    fn verify(&self, epoch: u64, generation: u64) -> Result<()> {
        let state = self.epoch.lock().unwrap();
        match state.holder {
            Some((current, gen)) if gen != generation => Err(ReceiveError::Disconnected {
                current: epoch,
                superseding: current,
            }),
            _ => Ok(()),
        }
    }
}

/// In-process broker with a fixed partition set.
pub struct InMemoryBroker {
    partitions: HashMap<String, Arc<PartitionLog>>,
    ids: Vec<String>,
}

impl InMemoryBroker {
    /// Create a broker with `partition_count` partitions named "0".."n-1".
    pub fn new(partition_count: u32) -> Self {
        let ids: Vec<String> = (0..partition_count).map(|p| p.to_string()).collect();
        let partitions = ids
            .iter()
            .map(|id| (id.clone(), Arc::new(PartitionLog::new())))
            .collect();
        Self { partitions, ids }
    }

    /// Append an event to a partition. Panics on unknown partitions; test
    /// code constructs the broker and knows its partition set.
    pub fn publish(&self, partition_id: &str, body: impl Into<Bytes>) -> EventData {
        self.partitions[partition_id].append(body.into(), HashMap::new())
    }

    /// A cloneable handle for publishing to one partition.
    pub fn sender(&self, partition_id: &str) -> PartitionSender {
        PartitionSender {
            log: Arc::clone(&self.partitions[partition_id]),
        }
    }

    /// Number of events stored in a partition.
    pub fn partition_len(&self, partition_id: &str) -> usize {
        self.partitions[partition_id].events.lock().unwrap().len()
    }
}

/// Publishing handle bound to one partition.
#[derive(Clone)]
pub struct PartitionSender {
    log: Arc<PartitionLog>,
}

impl PartitionSender {
    pub fn send(&self, body: impl Into<Bytes>) -> EventData {
        self.log.append(body.into(), HashMap::new())
    }

    pub fn send_with_properties(
        &self,
        body: impl Into<Bytes>,
        properties: HashMap<String, String>,
    ) -> EventData {
        self.log.append(body.into(), properties)
    }
}

#[async_trait]
impl ReceiverFactory for InMemoryBroker {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        Ok(self.ids.clone())
    }

    async fn open(
        &self,
        partition_id: &str,
        position: EventPosition,
        _prefetch_count: u32,
        epoch: Option<u64>,
    ) -> Result<Box<dyn Receiver>> {
        let log = self
            .partitions
            .get(partition_id)
            .cloned()
            .ok_or_else(|| ReceiveError::UnknownPartition(partition_id.to_string()))?;

        let grant = match epoch {
            Some(e) => Some((e, log.grant(e)?)),
            None => None,
        };

        let end_sequence_at_open = log.last_sequence();

        Ok(Box::new(InMemoryReceiver {
            log,
            position,
            end_sequence_at_open,
            cursor: 0,
            grant,
            closed: false,
        }))
    }
}

struct InMemoryReceiver {
    log: Arc<PartitionLog>,
    position: EventPosition,
    end_sequence_at_open: Option<u64>,
    /// Index of the next log entry to examine.
    cursor: usize,
    /// (epoch, generation) if this is an epoch receiver.
    grant: Option<(u64, u64)>,
    closed: bool,
}

/// Scan forward from `cursor`, collecting up to `max_count` admitted events.
fn drain(
    log: &PartitionLog,
    position: EventPosition,
    end_sequence_at_open: Option<u64>,
    cursor: &mut usize,
    max_count: usize,
) -> Vec<EventData> {
    let events = log.events.lock().unwrap();
    let mut batch = Vec::new();
    while *cursor < events.len() && batch.len() < max_count {
        let event = &events[*cursor];
        *cursor += 1;
        if position.admits(
            event.offset,
            event.sequence_number,
            event.enqueued_at,
            end_sequence_at_open,
        ) {
            batch.push(event.clone());
        }
    }
    batch
}

#[async_trait]
impl Receiver for InMemoryReceiver {
    async fn receive(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<EventData>> {
        if self.closed {
            return Err(ReceiveError::Closed);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some((epoch, generation)) = self.grant {
                self.log.verify(epoch, generation)?;
            }

            // Register for wakeups before draining so a publish between the
            // drain and the wait is not missed.
            let notified = self.log.notify.notified();

            let batch = drain(
                &self.log,
                self.position,
                self.end_sequence_at_open,
                &mut self.cursor,
                max_count,
            );
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

fn current_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("System time before UNIX epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partition_ids() {
        let broker = InMemoryBroker::new(4);
        let ids = broker.partition_ids().await.unwrap();
        assert_eq!(ids, vec!["0", "1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_receive_in_order() {
        let broker = InMemoryBroker::new(1);
        broker.publish("0", "e1");
        broker.publish("0", "e2");
        broker.publish("0", "e3");

        let mut rx = broker
            .open("0", EventPosition::Start, 300, None)
            .await
            .unwrap();
        let batch = rx.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].body, Bytes::from("e1"));
        assert_eq!(batch[1].body, Bytes::from("e2"));
        assert_eq!(batch[2].body, Bytes::from("e3"));
        assert!(batch[0].sequence_number < batch[1].sequence_number);
        assert!(batch[0].offset < batch[1].offset);
    }

    #[tokio::test]
    async fn test_receive_respects_max_count() {
        let broker = InMemoryBroker::new(1);
        for i in 0..5 {
            broker.publish("0", format!("e{i}"));
        }
        let mut rx = broker
            .open("0", EventPosition::Start, 300, None)
            .await
            .unwrap();
        let batch = rx.receive(2, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 2);
        let batch = rx.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 3, "remaining events delivered next call");
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_empty() {
        let broker = InMemoryBroker::new(1);
        let mut rx = broker
            .open("0", EventPosition::Start, 300, None)
            .await
            .unwrap();
        let batch = rx.receive(10, Duration::from_millis(50)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_publish() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let mut rx = broker
            .open("0", EventPosition::Start, 300, None)
            .await
            .unwrap();

        let sender = broker.sender("0");
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            sender.send("late");
        });

        let batch = rx.receive(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, Bytes::from("late"));
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_offset_position_resumes_after() {
        let broker = InMemoryBroker::new(1);
        let e1 = broker.publish("0", "e1");
        let e2 = broker.publish("0", "e2");

        let mut rx = broker
            .open("0", EventPosition::Offset(e1.offset), 300, None)
            .await
            .unwrap();
        let batch = rx.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].offset, e2.offset);
    }

    #[tokio::test]
    async fn test_end_position_skips_existing() {
        let broker = InMemoryBroker::new(1);
        broker.publish("0", "old");

        let mut rx = broker
            .open("0", EventPosition::End, 300, None)
            .await
            .unwrap();
        broker.publish("0", "new");
        let batch = rx.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, Bytes::from("new"));
    }

    #[tokio::test]
    async fn test_unknown_partition() {
        let broker = InMemoryBroker::new(1);
        let err = broker
            .open("9", EventPosition::Start, 300, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReceiveError::UnknownPartition(p) if p == "9"));
    }

    #[tokio::test]
    async fn test_higher_epoch_disconnects_lower() {
        let broker = InMemoryBroker::new(1);
        broker.publish("0", "e1");

        let mut first = broker
            .open("0", EventPosition::Start, 300, Some(1))
            .await
            .unwrap();
        let batch = first.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);

        // A higher epoch takes the partition.
        let mut second = broker
            .open("0", EventPosition::Start, 300, Some(2))
            .await
            .unwrap();

        let err = first
            .receive(10, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, ReceiveError::Disconnected { current: 1, superseding: 2 }),
            "superseded receiver must be disconnected"
        );

        // The new receiver reads normally.
        let batch = second.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_lower_epoch_rejected_at_open() {
        let broker = InMemoryBroker::new(1);
        let _holder = broker
            .open("0", EventPosition::Start, 300, Some(5))
            .await
            .unwrap();

        let err = broker
            .open("0", EventPosition::Start, 300, Some(3))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ReceiveError::Disconnected { current: 3, superseding: 5 }
        ));
    }

    #[tokio::test]
    async fn test_closed_receiver_errors() {
        let broker = InMemoryBroker::new(1);
        let mut rx = broker
            .open("0", EventPosition::Start, 300, None)
            .await
            .unwrap();
        rx.close().await.unwrap();
        let err = rx.receive(10, Duration::from_millis(10)).await.err().unwrap();
        assert!(matches!(err, ReceiveError::Closed));
    }
}
