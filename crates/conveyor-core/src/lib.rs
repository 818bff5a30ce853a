//! Conveyor Core - Event Types and Broker Contracts
//!
//! This crate defines the data types and broker-facing contracts shared by
//! the rest of the Conveyor workspace:
//!
//! - **EventData**: a single event read from a partition
//! - **Checkpoint**: durable per-partition progress record
//! - **EventPosition**: where in a partition a receiver should start
//! - **Receiver / ReceiverFactory**: the contract the event broker client
//!   must satisfy; the partition pump consumes these traits and never talks
//!   to a concrete broker directly
//! - **InMemoryBroker**: an in-process implementation of the receiver
//!   contract used by tests and local development
//!
//! ## Design
//!
//! The broker itself (connections, prefetch, wire framing) is an external
//! collaborator. Everything here is expressed as `async_trait` objects so a
//! real broker client and the in-memory broker are interchangeable.

pub mod checkpoint;
pub mod memory;
pub mod position;
pub mod receiver;
pub mod record;

pub use checkpoint::Checkpoint;
pub use memory::{InMemoryBroker, PartitionSender};
pub use position::EventPosition;
pub use receiver::{ReceiveError, Receiver, ReceiverFactory};
pub use record::EventData;
