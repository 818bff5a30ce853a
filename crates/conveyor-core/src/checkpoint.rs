//! Checkpoint Tracking
//!
//! A checkpoint records how far a consumer group has processed a partition.
//! It is written through the checkpoint store (fenced by the current lease
//! token) and read back on pump startup to resume after the recorded offset.

use crate::position::EventPosition;
use serde::{Deserialize, Serialize};

/// Durable per-partition progress record.
///
/// The committed `(offset, sequence_number)` pair identifies the **last
/// processed** event; resumption starts strictly after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_id: String,
    pub offset: u64,
    pub sequence_number: u64,
}

impl Checkpoint {
    pub fn new(partition_id: impl Into<String>, offset: u64, sequence_number: u64) -> Self {
        Self {
            partition_id: partition_id.into(),
            offset,
            sequence_number,
        }
    }

    /// Position a receiver should open at to resume after this checkpoint.
    pub fn resume_position(&self) -> EventPosition {
        EventPosition::Offset(self.offset)
    }
}
