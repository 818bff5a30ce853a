//! Conveyor Host - Partition-Coordinated Event Processing
//!
//! A fleet of cooperating hosts shares the partitions of an event hub /
//! consumer-group pair. Each partition is owned by at most one host at a
//! time through fenced, time-bounded leases; ownership rebalances as hosts
//! join and leave; per-partition checkpoints survive owner crashes; and the
//! user's event processor sees a clean `open -> on_events* -> close`
//! lifecycle even while ownership migrates.
//!
//! ## Components
//!
//! - **EventProcessorHost**: lifecycle, identity, wiring
//! - **PartitionManager**: the scan/acquire/steal control loop
//! - **LeaseManager**: owned-lease tracking and renewal
//! - **PartitionPump**: per-partition reader + dispatcher
//! - **EventProcessor / EventProcessorFactory / PartitionContext**: the
//!   user-facing contract
//!
//! Delivery is at-least-once with owner-stable checkpoints: events within a
//! partition arrive in broker order, a committed checkpoint is durable, and
//! resumption starts strictly after it. No ordering is offered across
//! partitions.

pub mod error;
pub mod host;
pub mod lease_manager;
pub mod manager;
pub mod options;
pub mod processor;
pub mod pump;

pub use error::{HostError, Result};
pub use host::{EventProcessorHost, EventProcessorHostBuilder};
pub use lease_manager::LeaseManager;
pub use manager::PartitionManager;
pub use options::HostOptions;
pub use processor::{
    CloseReason, EventProcessor, EventProcessorFactory, PartitionContext, ProcessorError,
};
pub use pump::{PartitionPump, PumpState};
