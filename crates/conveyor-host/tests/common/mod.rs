//! Shared fixtures for host integration tests: a journaling processor, a
//! store wrapper with a kill switch, and compressed timings.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use async_trait::async_trait;
use conveyor_core::{Checkpoint, EventData};
use conveyor_host::{
    CloseReason, EventProcessor, EventProcessorFactory, EventProcessorHost, HostError,
    HostOptions, PartitionContext, ProcessorError,
};
use conveyor_store::{
    CheckpointStore, InMemoryLeaseStore, Lease, LeaseStore, Result as StoreResult, StoreError,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Timings compressed for tests: 100ms scans, 150ms renewals, 600ms leases.
pub fn fast_options() -> HostOptions {
    HostOptions {
        lease_duration: Duration::from_millis(600),
        renew_interval: Duration::from_millis(150),
        scan_interval: Duration::from_millis(100),
        startup_scan_delay: Duration::from_secs(5),
        receive_timeout: Duration::from_millis(50),
        drain_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

/// Poll `condition` until it holds or `timeout` expires.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// One recorded lifecycle event. Entries are appended in real-time order
/// across all hosts sharing the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Opened {
        host: String,
        partition: String,
    },
    Events {
        host: String,
        partition: String,
        bodies: Vec<String>,
        sequences: Vec<u64>,
    },
    Closed {
        host: String,
        partition: String,
        reason: CloseReason,
    },
    Errored {
        host: String,
        partition: String,
    },
}

#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<Entry>>,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, entry: Entry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Bodies delivered for one partition, in delivery order, any host.
    pub fn bodies_for_partition(&self, partition: &str) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Events {
                    partition: p,
                    bodies,
                    ..
                } if p == partition => Some(bodies),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn closes_for_host(&self, host: &str) -> Vec<(String, CloseReason)> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Closed {
                    host: h,
                    partition,
                    reason,
                } if h == host => Some((partition, reason)),
                _ => None,
            })
            .collect()
    }

    pub fn error_count(&self, partition: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| matches!(e, Entry::Errored { partition: p, .. } if p == partition))
            .count()
    }

    /// Every `Opened` has exactly one matching `Closed`, with all `Events`
    /// for that (host, partition) strictly between them.
    pub fn assert_lifecycle_pairing(&self) {
        let entries = self.snapshot();
        let keys: HashSet<(String, String)> = entries
            .iter()
            .map(|e| match e {
                Entry::Opened { host, partition }
                | Entry::Errored { host, partition }
                | Entry::Closed {
                    host, partition, ..
                } => (host.clone(), partition.clone()),
                Entry::Events {
                    host, partition, ..
                } => (host.clone(), partition.clone()),
            })
            .collect();

        for (host, partition) in keys {
            let mut open = false;
            let mut opened_total = 0;
            let mut closed_total = 0;
            for entry in &entries {
                match entry {
                    Entry::Opened {
                        host: h,
                        partition: p,
                    } if *h == host && *p == partition => {
                        assert!(!open, "{host}/{partition}: open while already open");
                        open = true;
                        opened_total += 1;
                    }
                    Entry::Closed {
                        host: h,
                        partition: p,
                        ..
                    } if *h == host && *p == partition => {
                        assert!(open, "{host}/{partition}: close without open");
                        open = false;
                        closed_total += 1;
                    }
                    Entry::Events {
                        host: h,
                        partition: p,
                        ..
                    } if *h == host && *p == partition => {
                        assert!(open, "{host}/{partition}: events outside open/close");
                    }
                    _ => {}
                }
            }
            assert_eq!(
                opened_total, closed_total,
                "{host}/{partition}: every open must be matched by one close"
            );
        }
    }
}

/// Journaling processor. Checkpoints after each non-empty batch when
/// configured; checkpoint failures during ownership migration are expected
/// and ignored. `fail_once` partitions fail their next batch, then recover.
pub struct JournalProcessor {
    journal: Arc<Journal>,
    host: String,
    partition: String,
    checkpoint_batches: bool,
    fail_once: Arc<Mutex<HashSet<String>>>,
}

#[async_trait]
impl EventProcessor for JournalProcessor {
    async fn open(&mut self, _context: &PartitionContext) -> Result<(), ProcessorError> {
        self.journal.record(Entry::Opened {
            host: self.host.clone(),
            partition: self.partition.clone(),
        });
        Ok(())
    }

    async fn on_events(
        &mut self,
        context: &PartitionContext,
        events: Vec<EventData>,
    ) -> Result<(), ProcessorError> {
        if self.fail_once.lock().unwrap().remove(&self.partition) {
            return Err("injected processor failure".into());
        }

        self.journal.record(Entry::Events {
            host: self.host.clone(),
            partition: self.partition.clone(),
            bodies: events
                .iter()
                .map(|e| String::from_utf8_lossy(&e.body).to_string())
                .collect(),
            sequences: events.iter().map(|e| e.sequence_number).collect(),
        });

        if self.checkpoint_batches && !events.is_empty() {
            if let Err(e) = context.checkpoint().await {
                match e {
                    HostError::CheckpointRejected { .. } | HostError::Store(_) => {}
                    other => return Err(other.to_string().into()),
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self, _context: &PartitionContext, reason: CloseReason) {
        self.journal.record(Entry::Closed {
            host: self.host.clone(),
            partition: self.partition.clone(),
            reason,
        });
    }

    async fn on_error(&mut self, _context: &PartitionContext, _error: &HostError) {
        self.journal.record(Entry::Errored {
            host: self.host.clone(),
            partition: self.partition.clone(),
        });
    }
}

pub struct JournalFactory {
    pub journal: Arc<Journal>,
    pub checkpoint_batches: bool,
    pub fail_once: Arc<Mutex<HashSet<String>>>,
}

impl JournalFactory {
    pub fn new(journal: Arc<Journal>, checkpoint_batches: bool) -> Arc<Self> {
        Arc::new(Self {
            journal,
            checkpoint_batches,
            fail_once: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Make the next batch on `partition` fail.
    pub fn fail_next_batch(&self, partition: &str) {
        self.fail_once.lock().unwrap().insert(partition.to_string());
    }
}

#[async_trait]
impl EventProcessorFactory for JournalFactory {
    async fn create(
        &self,
        context: &PartitionContext,
    ) -> Result<Box<dyn EventProcessor>, ProcessorError> {
        Ok(Box::new(JournalProcessor {
            journal: Arc::clone(&self.journal),
            host: context.host_name().to_string(),
            partition: context.partition_id().to_string(),
            checkpoint_batches: self.checkpoint_batches,
            fail_once: Arc::clone(&self.fail_once),
        }))
    }
}

/// Store wrapper with a kill switch: once killed, every operation fails
/// transiently, as if this host lost its network path to the store. The
/// underlying shared store is untouched, so other hosts keep going.
pub struct FaultableStore {
    inner: Arc<InMemoryLeaseStore>,
    killed: AtomicBool,
}

impl FaultableStore {
    pub fn new(inner: Arc<InMemoryLeaseStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            killed: AtomicBool::new(false),
        })
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FaultableStore {
    async fn ensure_store(&self) -> StoreResult<()> {
        self.check()?;
        self.inner.ensure_store().await
    }

    async fn create_lease_if_not_exists(&self, partition_id: &str) -> StoreResult<Lease> {
        self.check()?;
        self.inner.create_lease_if_not_exists(partition_id).await
    }

    async fn get_all_leases(&self) -> StoreResult<Vec<Lease>> {
        self.check()?;
        self.inner.get_all_leases().await
    }

    async fn acquire(&self, lease: &Lease, owner: &str, ttl: Duration) -> StoreResult<Lease> {
        self.check()?;
        self.inner.acquire(lease, owner, ttl).await
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> StoreResult<Lease> {
        self.check()?;
        self.inner.renew(lease, ttl).await
    }

    async fn release(&self, lease: &Lease) -> StoreResult<()> {
        self.check()?;
        self.inner.release(lease).await
    }

    async fn update_lease(&self, lease: &Lease) -> StoreResult<Lease> {
        self.check()?;
        self.inner.update_lease(lease).await
    }
}

#[async_trait]
impl CheckpointStore for FaultableStore {
    async fn get_checkpoint(&self, partition_id: &str) -> StoreResult<Option<Checkpoint>> {
        self.check()?;
        self.inner.get_checkpoint(partition_id).await
    }

    async fn update_checkpoint(
        &self,
        lease: &Lease,
        checkpoint: &Checkpoint,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner.update_checkpoint(lease, checkpoint).await
    }
}

/// Route host logs through the test harness; `RUST_LOG` controls
/// verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a host against shared broker/store fixtures.
pub fn make_host(
    name: &str,
    broker: &Arc<conveyor_core::InMemoryBroker>,
    lease_store: Arc<dyn LeaseStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
) -> EventProcessorHost {
    init_tracing();
    EventProcessorHost::builder()
        .host_name(name)
        .event_hub_path("telemetry")
        .consumer_group("$default")
        .options(fast_options())
        .lease_store(lease_store)
        .checkpoint_store(checkpoint_store)
        .receiver_factory(Arc::clone(broker) as Arc<dyn conveyor_core::ReceiverFactory>)
        .build()
        .expect("host builds")
}
