//! Starting Positions
//!
//! Where in a partition a receiver should begin reading. A checkpointed pump
//! resumes with `Offset`, a fresh pump starts from the host's configured
//! initial position.

use serde::{Deserialize, Serialize};

/// Starting position for a partition receiver.
///
/// `Offset` and `Sequence` are **exclusive**: the first event delivered is
/// strictly after the given value. This matches checkpoint semantics - a
/// committed checkpoint `(o, s)` means `o` was already processed, so
/// resumption at `Offset(o)` never replays it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPosition {
    /// Beginning of the partition.
    Start,
    /// Only events enqueued after the receiver opens.
    End,
    /// Events strictly after this offset.
    Offset(u64),
    /// Events strictly after this sequence number.
    Sequence(u64),
    /// Events enqueued at or after this timestamp (ms since epoch).
    Timestamp(i64),
}

impl Default for EventPosition {
    fn default() -> Self {
        EventPosition::Start
    }
}

impl EventPosition {
    /// Whether an event at (offset, sequence, enqueued_at) is visible from
    /// this position, given the partition's current end sequence at open time.
    ///
    /// `end_sequence_at_open` is the highest sequence number that existed when
    /// the receiver opened; `End` only admits events after it.
    pub fn admits(
        &self,
        offset: u64,
        sequence: u64,
        enqueued_at: i64,
        end_sequence_at_open: Option<u64>,
    ) -> bool {
        match *self {
            EventPosition::Start => true,
            EventPosition::End => match end_sequence_at_open {
                Some(end) => sequence > end,
                None => true,
            },
            EventPosition::Offset(o) => offset > o,
            EventPosition::Sequence(s) => sequence > s,
            EventPosition::Timestamp(t) => enqueued_at >= t,
        }
    }
}
