//! Partition Manager
//!
//! One control loop per host. Each tick it enumerates the lease table,
//! acquires whatever is unowned or expired, steals at most one lease to
//! rebalance, and reaps pumps that reached a terminal state. Lease renewal
//! runs in its own task; a lost lease is reported to this loop, which stops
//! the affected pump.
//!
//! ## Rebalancing
//!
//! The equal-share rule: total partitions divided by the distinct live
//! owners (including this host), the remainder going to the first hosts in
//! sorted name order. A host below its target picks one victim partition
//! from the most-loaded over-target host (lexicographically smallest
//! partition id) and attempts an acquire presenting the victim's observed
//! token; the store CAS settles races. One steal per tick keeps the fleet
//! from oscillating.

use crate::error::{HostError, Result};
use crate::lease_manager::LeaseManager;
use crate::options::HostOptions;
use crate::processor::{CloseReason, EventProcessorFactory};
use crate::pump::{PartitionPump, PumpArgs, PumpState};
use conveyor_core::ReceiverFactory;
use conveyor_store::{CheckpointStore, Lease, LeaseStore};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Fleet-wide scan/steal/assign control loop for one host.
pub struct PartitionManager {
    inner: Arc<ManagerInner>,
    lost_rx: RwLock<Option<mpsc::UnboundedReceiver<String>>>,
    scan_handle: RwLock<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

struct ManagerInner {
    host_name: String,
    event_hub_path: String,
    consumer_group: String,
    options: HostOptions,
    lease_store: Arc<dyn LeaseStore>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    receiver_factory: Arc<dyn ReceiverFactory>,
    processor_factory: Arc<dyn EventProcessorFactory>,
    lease_manager: Arc<LeaseManager>,
    pumps: RwLock<HashMap<String, PartitionPump>>,
    partition_ids: RwLock<Vec<String>>,
}

impl PartitionManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host_name: String,
        event_hub_path: String,
        consumer_group: String,
        options: HostOptions,
        lease_store: Arc<dyn LeaseStore>,
        checkpoint_store: Arc<dyn CheckpointStore>,
        receiver_factory: Arc<dyn ReceiverFactory>,
        processor_factory: Arc<dyn EventProcessorFactory>,
    ) -> Self {
        let (lease_manager, lost_rx) = LeaseManager::new(
            host_name.clone(),
            Arc::clone(&lease_store),
            options.lease_duration,
            options.renew_interval,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ManagerInner {
                host_name,
                event_hub_path,
                consumer_group,
                options,
                lease_store,
                checkpoint_store,
                receiver_factory,
                processor_factory,
                lease_manager,
                pumps: RwLock::new(HashMap::new()),
                partition_ids: RwLock::new(Vec::new()),
            }),
            lost_rx: RwLock::new(Some(lost_rx)),
            scan_handle: RwLock::new(None),
            shutdown_tx,
        }
    }

    /// Start coordinating: ensure the store, enumerate partitions, run the
    /// first scan, then hand off to the background loop.
    ///
    /// Store or broker failures here are returned to the caller;
    /// registration fails synchronously.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;

        inner.lease_store.ensure_store().await?;

        let partition_ids = inner.receiver_factory.partition_ids().await?;
        info!(
            host = %inner.host_name,
            partitions = partition_ids.len(),
            "Coordinating partition set"
        );
        for partition_id in &partition_ids {
            inner.lease_store.create_lease_if_not_exists(partition_id).await?;
        }
        *inner.partition_ids.write().await = partition_ids;

        // First scan inline, bounded so a slow store cannot stall
        // registration past the configured startup delay.
        if tokio::time::timeout(inner.options.startup_scan_delay, inner.run_scan())
            .await
            .is_err()
        {
            warn!(host = %inner.host_name, "Initial scan exceeded startup delay");
        }

        inner.lease_manager.start_renewal_task().await;

        let Some(lost_rx) = self.lost_rx.write().await.take() else {
            return Err(HostError::AlreadyRegistered);
        };
        let shutdown_rx = self.shutdown_tx.subscribe();
        let loop_inner = Arc::clone(inner);
        let handle = tokio::spawn(run_loop(loop_inner, lost_rx, shutdown_rx));
        *self.scan_handle.write().await = Some(handle);

        Ok(())
    }

    /// Stop the loop, drain the pumps, release the leases.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.scan_handle.write().await.take() {
            let _ = handle.await;
        }
        self.inner.lease_manager.stop_renewal_task().await;

        {
            let pumps = self.inner.pumps.read().await;
            for pump in pumps.values() {
                pump.stop(CloseReason::Shutdown);
            }
        }

        let drained = tokio::time::timeout(self.inner.options.drain_timeout, async {
            let mut pumps = self.inner.pumps.write().await;
            for pump in pumps.values_mut() {
                pump.join().await;
            }
        })
        .await;

        if drained.is_err() {
            let mut pumps = self.inner.pumps.write().await;
            for (partition_id, pump) in pumps.iter_mut() {
                if !pump.is_terminal() {
                    warn!(
                        host = %self.inner.host_name,
                        partition = %partition_id,
                        "Pump did not drain in time; abandoning, lease will expire"
                    );
                    pump.abort();
                    self.inner.lease_manager.discard(partition_id).await;
                }
            }
        }

        self.inner.pumps.write().await.clear();
        self.inner.lease_manager.release_all().await;
        info!(host = %self.inner.host_name, "Partition manager shut down");
    }

    /// Partition ids this host currently owns.
    pub async fn owned_partitions(&self) -> Vec<String> {
        self.inner.lease_manager.owned_ids().await
    }

    /// State of the pump for a partition, if one exists.
    pub async fn pump_state(&self, partition_id: &str) -> Option<PumpState> {
        self.inner
            .pumps
            .read()
            .await
            .get(partition_id)
            .map(|p| p.state())
    }
}

async fn run_loop(
    inner: Arc<ManagerInner>,
    mut lost_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        host = %inner.host_name,
        interval_ms = inner.options.scan_interval.as_millis() as u64,
        "Partition scan loop started"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(inner.options.scan_interval) => {
                inner.run_scan().await;
            }
            Some(partition_id) = lost_rx.recv() => {
                inner.on_lease_lost(&partition_id).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!(host = %inner.host_name, "Partition scan loop stopped");
}

impl ManagerInner {
    /// One control-loop tick.
    async fn run_scan(&self) {
        // 1. Enumerate; a failing store skips the tick and never tears
        //    down pumps.
        let mut leases = match self.lease_store.get_all_leases().await {
            Ok(leases) => leases,
            Err(e) => {
                warn!(
                    host = %self.host_name,
                    error = %e,
                    "Lease enumeration failed; skipping scan tick"
                );
                return;
            }
        };

        // 2. Ensure a lease record exists for every partition.
        let known: HashSet<String> = leases.iter().map(|l| l.partition_id.clone()).collect();
        let partition_ids = self.partition_ids.read().await.clone();
        for partition_id in &partition_ids {
            if known.contains(partition_id) {
                continue;
            }
            match self.lease_store.create_lease_if_not_exists(partition_id).await {
                Ok(lease) => leases.push(lease),
                Err(e) => {
                    warn!(
                        host = %self.host_name,
                        partition = %partition_id,
                        error = %e,
                        "Failed to create lease record"
                    );
                }
            }
        }

        // 3/4. Acquire anything unowned or expired.
        for lease in &leases {
            if self.lease_manager.is_owned(&lease.partition_id).await {
                continue;
            }
            if !lease.is_available() {
                continue;
            }
            match self.lease_manager.try_acquire(lease).await {
                Ok(Some(cell)) => self.start_pump(&lease.partition_id, cell).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        host = %self.host_name,
                        partition = %lease.partition_id,
                        error = %e,
                        "Lease acquire failed"
                    );
                }
            }
        }

        // 5. At most one steal per tick.
        let owned: HashSet<String> = self.lease_manager.owned_ids().await.into_iter().collect();
        if let Some(victim) = plan_steal(&self.host_name, &owned, &leases) {
            info!(
                host = %self.host_name,
                partition = %victim.partition_id,
                victim_owner = %victim.owner,
                "Stealing lease to rebalance"
            );
            match self.lease_manager.try_acquire(&victim).await {
                Ok(Some(cell)) => self.start_pump(&victim.partition_id, cell).await,
                Ok(None) => {
                    debug!(
                        host = %self.host_name,
                        partition = %victim.partition_id,
                        "Steal lost the race"
                    );
                }
                Err(e) => {
                    warn!(
                        host = %self.host_name,
                        partition = %victim.partition_id,
                        error = %e,
                        "Steal attempt failed"
                    );
                }
            }
        }

        // 6/7. Reap pumps that reached a terminal state.
        self.reap_terminal_pumps().await;
    }

    async fn on_lease_lost(&self, partition_id: &str) {
        warn!(
            host = %self.host_name,
            partition = %partition_id,
            "Lease lost; stopping pump"
        );
        if let Some(pump) = self.pumps.read().await.get(partition_id) {
            pump.stop(CloseReason::LeaseLost);
        }
        // The pump is reaped on the next scan tick.
    }

    async fn start_pump(&self, partition_id: &str, lease: Arc<RwLock<Lease>>) {
        let mut pumps = self.pumps.write().await;
        if let Some(existing) = pumps.get(partition_id) {
            if !existing.is_terminal() {
                return;
            }
        }

        let pump = PartitionPump::start(PumpArgs {
            host_name: self.host_name.clone(),
            event_hub_path: self.event_hub_path.clone(),
            consumer_group: self.consumer_group.clone(),
            partition_id: partition_id.to_string(),
            options: self.options.clone(),
            lease,
            receiver_factory: Arc::clone(&self.receiver_factory),
            checkpoint_store: Arc::clone(&self.checkpoint_store),
            processor_factory: Arc::clone(&self.processor_factory),
        });
        pumps.insert(partition_id.to_string(), pump);

        info!(
            host = %self.host_name,
            partition = %partition_id,
            "Started partition pump"
        );
    }

    async fn reap_terminal_pumps(&self) {
        let mut pumps = self.pumps.write().await;
        let terminal: Vec<String> = pumps
            .iter()
            .filter(|(_, pump)| pump.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        for partition_id in terminal {
            if let Some(mut pump) = pumps.remove(&partition_id) {
                let state = pump.state();
                pump.join().await;
                // Failed pumps and shutdown-stopped pumps give the lease
                // back; a lease that already moved on conflicts harmlessly.
                self.lease_manager.release(&partition_id).await;
                debug!(
                    host = %self.host_name,
                    partition = %partition_id,
                    state = ?state,
                    "Reaped partition pump"
                );
            }
        }
    }
}

/// Pick the single partition to steal this tick, if the equal-share rule
/// says this host deserves more.
fn plan_steal(host_name: &str, owned_by_me: &HashSet<String>, leases: &[Lease]) -> Option<Lease> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    counts.insert(host_name.to_string(), 0);
    let mut foreign: HashMap<String, Vec<&Lease>> = HashMap::new();

    for lease in leases {
        if owned_by_me.contains(&lease.partition_id) {
            *counts.entry(host_name.to_string()).or_default() += 1;
        } else if lease.is_owned() && !lease.is_expired() {
            *counts.entry(lease.owner.clone()).or_default() += 1;
            foreign.entry(lease.owner.clone()).or_default().push(lease);
        }
    }

    if counts.len() < 2 {
        return None;
    }

    let total = leases.len();
    let owners = counts.len();
    let base = total / owners;
    let remainder = total % owners;
    // BTreeMap iterates in sorted name order; the first `remainder` hosts
    // absorb the leftover partitions.
    let targets: HashMap<&str, usize> = counts
        .keys()
        .enumerate()
        .map(|(index, name)| (name.as_str(), base + usize::from(index < remainder)))
        .collect();

    let my_count = counts[host_name];
    if my_count >= targets[host_name] {
        return None;
    }

    // Victim: the most-loaded host above its own target; sorted iteration
    // makes the tie-break (smallest name) deterministic.
    let mut victim: Option<(&str, usize)> = None;
    for (name, &count) in &counts {
        if name == host_name || count <= targets[name.as_str()] {
            continue;
        }
        if victim.map_or(true, |(_, best)| count > best) {
            victim = Some((name.as_str(), count));
        }
    }

    let (victim_name, _) = victim?;
    let mut candidates = foreign.remove(victim_name)?;
    candidates.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
    candidates.first().map(|lease| (*lease).clone())
}
