//! Host Options
//!
//! Tuning knobs for lease timing, the scan cadence, and event delivery.
//! Defaults suit production; tests compress the timings by orders of
//! magnitude.

use crate::error::{HostError, Result};
use conveyor_core::EventPosition;
use std::time::Duration;

/// Configuration for an event processor host.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// TTL written on every lease acquire and renew (default: 30s).
    pub lease_duration: Duration,

    /// Cadence of the lease renewal task; must be shorter than
    /// `lease_duration`, one third is the usual ratio (default: 10s).
    pub renew_interval: Duration,

    /// Cadence of the partition manager scan loop (default: 10s).
    pub scan_interval: Duration,

    /// Cap on how long registration waits for the initial scan
    /// (default: 30s).
    pub startup_scan_delay: Duration,

    /// Maximum events per `on_events` batch (default: 10).
    pub max_batch_size: usize,

    /// How long a receive waits before returning an empty batch
    /// (default: 60s).
    pub receive_timeout: Duration,

    /// Prefetch count requested from the broker receiver (default: 300).
    pub prefetch_count: u32,

    /// Deliver an empty batch when `receive_timeout` elapses with no events
    /// (default: false).
    pub invoke_on_timeout: bool,

    /// Where a pump starts when no checkpoint exists (default: stream
    /// start).
    pub initial_position: EventPosition,

    /// Wall-clock bound on pump drain during `unregister` (default: 10
    /// minutes). Pumps that do not drain in time are abandoned with
    /// logging and their leases left to expire.
    pub drain_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            scan_interval: Duration::from_secs(10),
            startup_scan_delay: Duration::from_secs(30),
            max_batch_size: 10,
            receive_timeout: Duration::from_secs(60),
            prefetch_count: 300,
            invoke_on_timeout: false,
            initial_position: EventPosition::Start,
            drain_timeout: Duration::from_secs(600),
        }
    }
}

impl HostOptions {
    /// Validate the option set.
    pub fn validate(&self) -> Result<()> {
        if self.renew_interval >= self.lease_duration {
            return Err(HostError::InvalidOptions(format!(
                "renew_interval ({:?}) must be shorter than lease_duration ({:?})",
                self.renew_interval, self.lease_duration
            )));
        }
        if self.max_batch_size == 0 {
            return Err(HostError::InvalidOptions(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.scan_interval.is_zero() {
            return Err(HostError::InvalidOptions(
                "scan_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
