//! In-Memory Lease Store
//!
//! Process-local implementation of the lease and checkpoint contracts. One
//! mutex-guarded map is the entire backend; the compare-and-set is the token
//! comparison done under that lock.
//!
//! Used as the coordination backend in tests (several hosts share one
//! instance through `Arc`) and supports transient-fault injection so the
//! control loop's skip-a-tick behavior can be exercised.

use crate::error::{Result, StoreError};
use crate::types::{current_timestamp_ms, Lease};
use crate::{CheckpointStore, LeaseStore};
use async_trait::async_trait;
use conveyor_core::Checkpoint;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

struct Entry {
    lease: Lease,
    checkpoint: Option<Checkpoint>,
}

/// In-process CAS lease store.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    entries: Mutex<HashMap<String, Entry>>,
    /// Remaining operations that should fail with `Transient`.
    transient_faults: AtomicU32,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store operations fail with
    /// `StoreError::Transient`.
    pub fn inject_transient(&self, count: u32) {
        self.transient_faults.store(count, Ordering::SeqCst);
    }

    /// Expire a held lease immediately (crash simulation for tests).
    pub fn force_expire(&self, partition_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(partition_id) {
            entry.lease.expires_at = 0;
        }
    }

    fn check_fault(&self) -> Result<()> {
        let remaining = self.transient_faults.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .transient_faults
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Transient("injected fault".to_string()));
        }
        Ok(())
    }

    fn new_token() -> String {
        Uuid::new_v4().to_string()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn ensure_store(&self) -> Result<()> {
        self.check_fault()
    }

    async fn create_lease_if_not_exists(&self, partition_id: &str) -> Result<Lease> {
        self.check_fault()?;
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(partition_id.to_string())
            .or_insert_with(|| Entry {
                lease: Lease::unowned(partition_id),
                checkpoint: None,
            });
        Ok(entry.lease.clone())
    }

    async fn get_all_leases(&self) -> Result<Vec<Lease>> {
        self.check_fault()?;
        let entries = self.entries.lock().unwrap();
        Ok(entries.values().map(|e| e.lease.clone()).collect())
    }

    async fn acquire(&self, lease: &Lease, owner: &str, ttl: Duration) -> Result<Lease> {
        self.check_fault()?;
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StoreError::NotFound(lease.partition_id.clone()))?;

        let stored = &mut entry.lease;
        let token_matches = !lease.token.is_empty() && lease.token == stored.token;
        if !stored.is_available() && !token_matches {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: format!("held by {}", stored.owner),
            });
        }

        stored.owner = owner.to_string();
        stored.token = Self::new_token();
        stored.epoch += 1;
        stored.expires_at = current_timestamp_ms() + ttl.as_millis() as i64;
        Ok(stored.clone())
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        self.check_fault()?;
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StoreError::NotFound(lease.partition_id.clone()))?;

        let stored = &mut entry.lease;
        if lease.token.is_empty() || lease.token != stored.token {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: "token mismatch on renew".to_string(),
            });
        }

        stored.expires_at = current_timestamp_ms() + ttl.as_millis() as i64;
        Ok(stored.clone())
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.check_fault()?;
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StoreError::NotFound(lease.partition_id.clone()))?;

        let stored = &mut entry.lease;
        if lease.token.is_empty() || lease.token != stored.token {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: "token mismatch on release".to_string(),
            });
        }

        stored.owner = String::new();
        stored.token = String::new();
        stored.expires_at = 0;
        Ok(())
    }

    async fn update_lease(&self, lease: &Lease) -> Result<Lease> {
        self.check_fault()?;
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&lease.partition_id)
            .ok_or_else(|| StoreError::NotFound(lease.partition_id.clone()))?;

        let stored = &mut entry.lease;
        if lease.token.is_empty() || lease.token != stored.token {
            return Err(StoreError::Conflict {
                partition_id: lease.partition_id.clone(),
                detail: "token mismatch on update".to_string(),
            });
        }

        stored.owner = lease.owner.clone();
        Ok(stored.clone())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryLeaseStore {
    async fn get_checkpoint(&self, partition_id: &str) -> Result<Option<Checkpoint>> {
        self.check_fault()?;
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(partition_id).and_then(|e| e.checkpoint.clone()))
    }

    async fn update_checkpoint(&self, lease: &Lease, checkpoint: &Checkpoint) -> Result<()> {
        self.check_fault()?;
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(&checkpoint.partition_id)
            .ok_or_else(|| StoreError::NotFound(checkpoint.partition_id.clone()))?;

        if lease.token.is_empty() || lease.token != entry.lease.token {
            return Err(StoreError::Fenced {
                partition_id: checkpoint.partition_id.clone(),
            });
        }

        entry.checkpoint = Some(checkpoint.clone());
        Ok(())
    }
}
