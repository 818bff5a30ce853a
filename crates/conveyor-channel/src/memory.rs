//! In-Memory Link Pair
//!
//! A process-local transport implementing the link contracts, used to test
//! the channel without a broker. `link_pair` returns the two local link
//! halves plus a `RemotePeer` representing the other end of the session:
//! tests receive requests from it, send correlated replies through it, and
//! can close or fail the response link to exercise teardown.

use crate::error::{ChannelError, Result};
use crate::link::{EndpointState, LinkState, RequestLink, ResponseLink};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct PairShared {
    request_link: LinkState,
    response_link: LinkState,
    credit: u32,
    refuse_open: bool,
}

enum Inbound {
    Message(Message),
    Fault(String),
}

/// Local half of the outbound link.
pub struct MemoryRequestLink {
    shared: Arc<Mutex<PairShared>>,
    outbound: mpsc::UnboundedSender<Message>,
}

/// Local half of the inbound link.
pub struct MemoryResponseLink {
    shared: Arc<Mutex<PairShared>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// The far end of the session, driven by test code.
pub struct RemotePeer {
    shared: Arc<Mutex<PairShared>>,
    requests: mpsc::UnboundedReceiver<Message>,
    responses: Option<mpsc::UnboundedSender<Inbound>>,
}

/// Create a connected link pair and its remote peer.
pub fn link_pair() -> (MemoryRequestLink, MemoryResponseLink, RemotePeer) {
    let shared = Arc::new(Mutex::new(PairShared::default()));
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    (
        MemoryRequestLink {
            shared: Arc::clone(&shared),
            outbound: request_tx,
        },
        MemoryResponseLink {
            shared: Arc::clone(&shared),
            inbound: response_rx,
        },
        RemotePeer {
            shared,
            requests: request_rx,
            responses: Some(response_tx),
        },
    )
}

#[async_trait]
impl RequestLink for MemoryRequestLink {
    async fn open(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.refuse_open {
            return Err(ChannelError::Link("attach refused".to_string()));
        }
        shared.request_link.local = EndpointState::Active;
        shared.request_link.remote = EndpointState::Active;
        Ok(())
    }

    async fn close(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.request_link.local = EndpointState::Closed;
        // The in-memory peer acknowledges immediately.
        shared.request_link.remote = EndpointState::Closed;
    }

    fn state(&self) -> LinkState {
        self.shared.lock().unwrap().request_link
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        {
            let shared = self.shared.lock().unwrap();
            if shared.request_link.local != EndpointState::Active {
                return Err(ChannelError::Link("request link not open".to_string()));
            }
        }
        self.outbound
            .send(message)
            .map_err(|_| ChannelError::Link("request link detached".to_string()))
    }
}

#[async_trait]
impl ResponseLink for MemoryResponseLink {
    async fn open(&mut self) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.refuse_open {
            return Err(ChannelError::Link("attach refused".to_string()));
        }
        shared.response_link.local = EndpointState::Active;
        shared.response_link.remote = EndpointState::Active;
        Ok(())
    }

    async fn close(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.response_link.local = EndpointState::Closed;
        shared.response_link.remote = EndpointState::Closed;
    }

    fn state(&self) -> LinkState {
        self.shared.lock().unwrap().response_link
    }

    fn flow(&mut self, count: u32) {
        self.shared.lock().unwrap().credit += count;
    }

    async fn recv(&mut self) -> Result<Option<Message>> {
        match self.inbound.recv().await {
            Some(Inbound::Message(message)) => Ok(Some(message)),
            Some(Inbound::Fault(reason)) => Err(ChannelError::Link(reason)),
            None => {
                let mut shared = self.shared.lock().unwrap();
                shared.response_link.remote = EndpointState::Closed;
                Ok(None)
            }
        }
    }
}

impl RemotePeer {
    /// Next request shipped by the local side, or `None` once the request
    /// link is torn down.
    pub async fn recv_request(&mut self) -> Option<Message> {
        self.requests.recv().await
    }

    /// Send a reply, consuming one credit granted via `flow`.
    pub fn respond(&self, reply: Message) -> Result<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.credit == 0 {
                return Err(ChannelError::Link("no credit for response".to_string()));
            }
            shared.credit -= 1;
        }
        match &self.responses {
            Some(tx) => tx
                .send(Inbound::Message(reply))
                .map_err(|_| ChannelError::Link("response link detached".to_string())),
            None => Err(ChannelError::RemoteClosed),
        }
    }

    /// Close the response link from the remote side.
    pub fn close(&mut self) {
        self.responses = None;
    }

    /// Fail the response link with a protocol error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if let Some(tx) = self.responses.take() {
            let _ = tx.send(Inbound::Fault(reason.into()));
        }
    }

    /// Refuse subsequent link opens (must be set before the channel opens).
    pub fn refuse_opens(&self) {
        self.shared.lock().unwrap().refuse_open = true;
    }

    /// Credit currently granted and unconsumed.
    pub fn available_credit(&self) -> u32 {
        self.shared.lock().unwrap().credit
    }
}
