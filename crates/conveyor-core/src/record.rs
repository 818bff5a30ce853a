//! Event Data Structure
//!
//! This module defines the core `EventData` type - the unit of delivery in
//! Conveyor.
//!
//! ## Structure
//! Each event carries:
//! - **offset**: unique, monotonically increasing position within a partition
//! - **sequence_number**: broker-assigned sequence, also monotone per partition
//! - **enqueued_at**: when the broker accepted the event (ms since epoch)
//! - **body**: the payload (arbitrary bytes)
//! - **properties**: optional application-supplied string metadata
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for zero-copy handoff between receiver and processor
//! - Offsets and sequence numbers are u64 to support very large streams
//! - Implements `Serialize`/`Deserialize` so events can be captured in tests
//!   and replayed through the in-memory broker

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single event read from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventData {
    /// Offset of this event within its partition
    pub offset: u64,

    /// Broker-assigned sequence number within its partition
    pub sequence_number: u64,

    /// Enqueue timestamp in milliseconds since epoch
    pub enqueued_at: i64,

    /// Payload
    pub body: Bytes,

    /// Application-supplied metadata
    pub properties: HashMap<String, String>,
}

impl EventData {
    pub fn new(offset: u64, sequence_number: u64, enqueued_at: i64, body: Bytes) -> Self {
        Self {
            offset,
            sequence_number,
            enqueued_at,
            body,
            properties: HashMap::new(),
        }
    }

    /// Attach an application property, builder-style.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Estimate the size of this event in bytes.
    pub fn estimated_size(&self) -> usize {
        8 + // offset
        8 + // sequence_number
        8 + // enqueued_at
        self.body.len() +
        self.properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
    }
}
