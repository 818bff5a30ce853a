//! Link Contracts
//!
//! A channel runs over two unidirectional links: a request (sender) link and
//! a response (receiver) link. Each link has a local and a remote endpoint
//! state; the channel derives its own state from all four.

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;

/// State of one endpoint of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Uninitialized,
    Active,
    Closed,
}

/// Local and remote endpoint states of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub local: EndpointState,
    pub remote: EndpointState,
}

impl LinkState {
    pub fn new() -> Self {
        Self {
            local: EndpointState::Uninitialized,
            remote: EndpointState::Uninitialized,
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound (sender) link.
#[async_trait]
pub trait RequestLink: Send + 'static {
    /// Open the link; resolves once the remote endpoint is Active.
    async fn open(&mut self) -> Result<()>;

    /// Close the local endpoint; resolves once the close is on the wire.
    async fn close(&mut self);

    fn state(&self) -> LinkState;

    /// Ship one message.
    async fn send(&mut self, message: Message) -> Result<()>;
}

/// Inbound (receiver) link.
#[async_trait]
pub trait ResponseLink: Send + 'static {
    /// Open the link; resolves once the remote endpoint is Active.
    async fn open(&mut self) -> Result<()>;

    /// Close the local endpoint.
    async fn close(&mut self);

    fn state(&self) -> LinkState;

    /// Grant the remote side credit for `count` more messages.
    fn flow(&mut self, count: u32);

    /// Next inbound message. `Ok(None)` means the remote closed the link
    /// cleanly; an error means the link failed.
    async fn recv(&mut self) -> Result<Option<Message>>;
}
