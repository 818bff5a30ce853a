//! Conveyor Channel - Correlated Request/Reply
//!
//! A synchronous request/reply RPC run over two unidirectional message links
//! that share a session: requests go out on a sender link, replies come back
//! on a receiver link addressed to a per-channel private reply address.
//! Used for out-of-band control operations against the broker (metadata
//! queries, token refresh).
//!
//! ## Shape
//!
//! - **Message**: id / correlation id / reply-to / properties / body
//! - **RequestLink / ResponseLink**: the wire contracts; an in-memory pair
//!   is provided for tests
//! - **RequestResponseChannel**: assigns request ids, tracks in-flight
//!   requests, matches replies by correlation id
//!
//! The in-flight table lives inside a single dispatcher task that owns both
//! links, so it needs no locking.

pub mod channel;
pub mod error;
pub mod link;
pub mod memory;
pub mod message;

pub use channel::{ChannelState, RequestResponseChannel};
pub use error::{ChannelError, Result};
pub use link::{EndpointState, LinkState, RequestLink, ResponseLink};
pub use memory::{link_pair, RemotePeer};
pub use message::Message;
