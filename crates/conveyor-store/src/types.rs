//! Lease Type
//!
//! A lease is a time-bounded, fenced claim by one host on one partition.
//! The store issues an opaque token on every successful acquire; renew,
//! release, metadata updates and checkpoint writes must present the current
//! token, which is how stale owners are fenced out.

use serde::{Deserialize, Serialize};

/// A partition ownership lease.
///
/// - `owner` is empty while the partition is unowned.
/// - `token` is rotated by the store on every successful acquire.
/// - `epoch` strictly increases across acquisitions of the same partition.
/// - `expires_at` is absolute (ms since epoch); an expired lease is
///   acquirable by anyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub partition_id: String,
    pub owner: String,
    pub token: String,
    pub epoch: u64,
    pub expires_at: i64,
}

impl Lease {
    /// A fresh, unowned lease record for a partition.
    pub fn unowned(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            owner: String::new(),
            token: String::new(),
            epoch: 0,
            expires_at: 0,
        }
    }

    pub fn is_owned(&self) -> bool {
        !self.owner.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        current_timestamp_ms() >= self.expires_at
    }

    /// Owned by `host` and not yet expired.
    pub fn is_held_by(&self, host: &str) -> bool {
        self.owner == host && !self.is_expired()
    }

    /// Unowned, or owned but past its expiry: anyone may acquire it.
    pub fn is_available(&self) -> bool {
        !self.is_owned() || self.is_expired()
    }
}

/// Current timestamp in milliseconds since epoch.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
