//! Lease Manager - Partition Ownership for One Host
//!
//! Tracks the leases this host holds and keeps them alive. Acquisition
//! (including steals) goes through `try_acquire`; a background task renews
//! every owned lease each `renew_interval` and reports partitions whose
//! lease was lost so the partition manager can stop the affected pump.
//!
//! ## Policies
//!
//! - **Acquire**: one attempt; a conflict means another host won and is
//!   simply "not acquired". No tight retry - the next scan tick tries
//!   again.
//! - **Renew**: a conflict means the lease was stolen; transient failures
//!   get a bounded number of immediate retries, then the lease is treated
//!   as lost. The previous owner still runs its local stop sequence.
//!
//! The owned map stores each lease in an `Arc<RwLock<_>>` cell shared with
//! that partition's context, so checkpoints always present the freshest
//! token.

use conveyor_store::{Lease, LeaseStore, Result as StoreResult, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Immediate retries for a transient renew failure before the lease is
/// treated as lost.
const RENEW_RETRY_LIMIT: u32 = 3;

type OwnedMap = Arc<RwLock<HashMap<String, Arc<RwLock<Lease>>>>>;

/// Manages the leases held by this host.
pub struct LeaseManager {
    host_name: String,
    store: Arc<dyn LeaseStore>,
    lease_duration: Duration,
    renew_interval: Duration,
    owned: OwnedMap,
    lost_tx: mpsc::UnboundedSender<String>,
    renewal_handle: RwLock<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    /// Create a lease manager. The returned receiver yields partition ids
    /// whose lease was lost during renewal.
    pub fn new(
        host_name: String,
        store: Arc<dyn LeaseStore>,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            host_name,
            store,
            lease_duration,
            renew_interval,
            owned: Arc::new(RwLock::new(HashMap::new())),
            lost_tx,
            renewal_handle: RwLock::new(None),
        });
        (manager, lost_rx)
    }

    /// Attempt to acquire (or steal) a lease for this host.
    ///
    /// `lease` is the observed store record; presenting its token is what
    /// makes a steal legal. Returns the shared lease cell on success, `None`
    /// when the CAS lost or the store failed transiently, and an error only
    /// for non-retryable store failures.
    pub async fn try_acquire(
        &self,
        lease: &Lease,
    ) -> StoreResult<Option<Arc<RwLock<Lease>>>> {
        match self
            .store
            .acquire(lease, &self.host_name, self.lease_duration)
            .await
        {
            Ok(held) => {
                info!(
                    host = %self.host_name,
                    partition = %held.partition_id,
                    epoch = held.epoch,
                    "Acquired partition lease"
                );
                let cell = Arc::new(RwLock::new(held));
                self.owned
                    .write()
                    .await
                    .insert(lease.partition_id.clone(), Arc::clone(&cell));
                Ok(Some(cell))
            }
            Err(e) if e.is_conflict() => {
                debug!(
                    host = %self.host_name,
                    partition = %lease.partition_id,
                    "Lease acquire lost the race"
                );
                Ok(None)
            }
            Err(e) if e.is_transient() => {
                warn!(
                    host = %self.host_name,
                    partition = %lease.partition_id,
                    error = %e,
                    "Transient failure acquiring lease; will retry next scan"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release a held lease and forget it. A conflict means the lease
    /// already moved on; that is not an error here.
    pub async fn release(&self, partition_id: &str) {
        let cell = self.owned.write().await.remove(partition_id);
        let Some(cell) = cell else { return };

        let lease = cell.read().await.clone();
        match self.store.release(&lease).await {
            Ok(()) => {
                info!(
                    host = %self.host_name,
                    partition = %partition_id,
                    "Released partition lease"
                );
            }
            Err(e) if e.is_conflict() => {
                debug!(
                    host = %self.host_name,
                    partition = %partition_id,
                    "Lease already taken over; nothing to release"
                );
            }
            Err(e) => {
                warn!(
                    host = %self.host_name,
                    partition = %partition_id,
                    error = %e,
                    "Failed to release lease; it will expire on its own"
                );
            }
        }
    }

    /// Release every held lease (shutdown path).
    pub async fn release_all(&self) {
        let ids: Vec<String> = self.owned.read().await.keys().cloned().collect();
        for partition_id in ids {
            self.release(&partition_id).await;
        }
    }

    /// Forget a lease without touching the store (it is already lost).
    pub async fn discard(&self, partition_id: &str) {
        self.owned.write().await.remove(partition_id);
    }

    /// Partition ids currently held.
    pub async fn owned_ids(&self) -> Vec<String> {
        self.owned.read().await.keys().cloned().collect()
    }

    pub async fn owned_count(&self) -> usize {
        self.owned.read().await.len()
    }

    pub async fn is_owned(&self, partition_id: &str) -> bool {
        self.owned.read().await.contains_key(partition_id)
    }

    /// The shared lease cell for a held partition.
    pub async fn get(&self, partition_id: &str) -> Option<Arc<RwLock<Lease>>> {
        self.owned.read().await.get(partition_id).cloned()
    }

    /// Start the background renewal task.
    pub async fn start_renewal_task(&self) {
        let task = LeaseRenewalTask {
            host_name: self.host_name.clone(),
            store: Arc::clone(&self.store),
            owned: Arc::clone(&self.owned),
            lost_tx: self.lost_tx.clone(),
            lease_duration: self.lease_duration,
            interval: self.renew_interval,
        };
        let handle = tokio::spawn(task.run());
        *self.renewal_handle.write().await = Some(handle);

        info!(
            host = %self.host_name,
            interval_ms = self.renew_interval.as_millis() as u64,
            "Lease renewal task started"
        );
    }

    /// Stop the background renewal task.
    pub async fn stop_renewal_task(&self) {
        let mut handle_guard = self.renewal_handle.write().await;
        if let Some(handle) = handle_guard.take() {
            handle.abort();
            let _ = handle.await;
            info!(host = %self.host_name, "Lease renewal task stopped");
        }
    }
}

/// Background task that renews all owned leases.
struct LeaseRenewalTask {
    host_name: String,
    store: Arc<dyn LeaseStore>,
    owned: OwnedMap,
    lost_tx: mpsc::UnboundedSender<String>,
    lease_duration: Duration,
    interval: Duration,
}

impl LeaseRenewalTask {
    async fn run(self) {
        loop {
            tokio::time::sleep(self.interval).await;

            let snapshot: Vec<(String, Arc<RwLock<Lease>>)> = {
                let owned = self.owned.read().await;
                owned
                    .iter()
                    .map(|(k, v)| (k.clone(), Arc::clone(v)))
                    .collect()
            };

            for (partition_id, cell) in snapshot {
                let lease = cell.read().await.clone();
                match self.renew_with_retries(&lease).await {
                    Ok(renewed) => {
                        *cell.write().await = renewed;
                        debug!(
                            host = %self.host_name,
                            partition = %partition_id,
                            "Lease renewed"
                        );
                    }
                    Err(e) => {
                        warn!(
                            host = %self.host_name,
                            partition = %partition_id,
                            error = %e,
                            "Lease lost during renewal"
                        );
                        self.owned.write().await.remove(&partition_id);
                        let _ = self.lost_tx.send(partition_id);
                    }
                }
            }
        }
    }

    async fn renew_with_retries(&self, lease: &Lease) -> StoreResult<Lease> {
        let mut attempts = 0;
        loop {
            match self.store.renew(lease, self.lease_duration).await {
                Ok(renewed) => return Ok(renewed),
                Err(StoreError::Transient(detail)) if attempts < RENEW_RETRY_LIMIT => {
                    attempts += 1;
                    debug!(
                        host = %self.host_name,
                        partition = %lease.partition_id,
                        attempts,
                        detail = %detail,
                        "Retrying transient renew failure"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
