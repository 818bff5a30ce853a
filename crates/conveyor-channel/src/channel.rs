//! Request/Response Channel
//!
//! Multiplexes correlated request/reply messages over a request link and a
//! response link. A single dispatcher task owns both links and the table of
//! in-flight requests, so the table is accessed from one thread of control
//! and needs no locks.
//!
//! ## Protocol
//!
//! - `request` stamps a fresh monotonic message id and the channel's private
//!   reply address, grants the response link one credit, and ships the
//!   message; the reply is matched by `correlation_id` and resolves the
//!   caller exactly once.
//! - A link failure resolves every pending request with the same error and
//!   tears the channel down.
//! - `close` closes both links, after which further requests are rejected.

use crate::error::{ChannelError, Result};
use crate::link::{EndpointState, LinkState, RequestLink, ResponseLink};
use crate::message::Message;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Aggregate state derived from the four link endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Some endpoint has not initialized yet.
    Opening,
    /// All four endpoints are Active.
    Opened,
    /// Both remote endpoints are Closed.
    Closed,
    /// Anything in between (some endpoints active, some closed).
    Closing,
}

impl ChannelState {
    /// The state formula: Opening until every endpoint initialized, Opened
    /// only when all four are Active, Closed when both remotes are Closed.
    pub fn derive(send: LinkState, recv: LinkState) -> ChannelState {
        use EndpointState::Uninitialized;

        if send.local == Uninitialized
            || send.remote == Uninitialized
            || recv.local == Uninitialized
            || recv.remote == Uninitialized
        {
            return ChannelState::Opening;
        }

        if send.local == EndpointState::Active
            && send.remote == EndpointState::Active
            && recv.local == EndpointState::Active
            && recv.remote == EndpointState::Active
        {
            return ChannelState::Opened;
        }

        if send.remote == EndpointState::Closed && recv.remote == EndpointState::Closed {
            return ChannelState::Closed;
        }

        ChannelState::Closing
    }
}

enum Command {
    Request {
        message: Message,
        respond: oneshot::Sender<Result<Message>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to an open request/response channel. Cloneable; requests may be
/// issued concurrently from any task.
#[derive(Clone)]
pub struct RequestResponseChannel {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ChannelState>,
    reply_to: String,
}

impl RequestResponseChannel {
    /// Open a channel over the given link pair.
    ///
    /// Resolves once **both** remote endpoints are Active; the first link
    /// open error fails the whole open.
    pub async fn open<S, R>(name: &str, path: &str, mut request_link: S, mut response_link: R) -> Result<Self>
    where
        S: RequestLink,
        R: ResponseLink,
    {
        let reply_to = format!("{}-client-reply-to", path.replace('$', ""));

        let (send_open, recv_open) = tokio::join!(request_link.open(), response_link.open());
        if let Err(e) = send_open.and(recv_open) {
            return Err(ChannelError::OpenFailed(e.to_string()));
        }

        let initial = ChannelState::derive(request_link.state(), response_link.state());
        let (state_tx, state_rx) = watch::channel(initial);
        let (command_tx, command_rx) = mpsc::channel(64);

        info!(channel = %name, reply_to = %reply_to, "Request/response channel opened");

        let dispatcher = Dispatcher {
            name: name.to_string(),
            reply_to: reply_to.clone(),
            request_link,
            response_link,
            command_rx,
            state_tx,
            inflight: HashMap::new(),
            next_request_id: 0,
        };
        tokio::spawn(dispatcher.run());

        Ok(Self {
            command_tx,
            state_rx,
            reply_to,
        })
    }

    /// Issue a request and await its correlated reply.
    ///
    /// The message must not carry an id or reply address; the channel
    /// assigns both. Resolves exactly once: with the reply, or with the
    /// error that terminated the link.
    pub async fn request(&self, message: Message) -> Result<Message> {
        if message.message_id.is_some() {
            return Err(ChannelError::InvalidRequest(
                "message_id must be unset".to_string(),
            ));
        }
        if message.reply_to.is_some() {
            return Err(ChannelError::InvalidRequest(
                "reply_to must be unset".to_string(),
            ));
        }

        let (respond, reply) = oneshot::channel();
        self.command_tx
            .send(Command::Request { message, respond })
            .await
            .map_err(|_| ChannelError::ChannelClosed)?;

        reply.await.map_err(|_| ChannelError::ChannelClosed)?
    }

    /// Close both links. Resolves once both local closes complete;
    /// idempotent.
    pub async fn close(&self) -> Result<()> {
        let (done, closed) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Close { done })
            .await
            .is_err()
        {
            // Dispatcher already gone.
            return Ok(());
        }
        let _ = closed.await;
        Ok(())
    }

    /// Current aggregate state.
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Resolves when the channel reaches `Closed` (or the dispatcher is
    /// gone).
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow() == ChannelState::Closed {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The private reply address replies are routed to.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }
}

struct Dispatcher<S: RequestLink, R: ResponseLink> {
    name: String,
    reply_to: String,
    request_link: S,
    response_link: R,
    command_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ChannelState>,
    inflight: HashMap<u64, oneshot::Sender<Result<Message>>>,
    next_request_id: u64,
}

impl<S: RequestLink, R: ResponseLink> Dispatcher<S, R> {
    async fn run(mut self) {
        loop {
            self.publish_state();

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Command::Request { message, respond }) => {
                        self.handle_request(message, respond).await;
                    }
                    Some(Command::Close { done }) => {
                        self.shutdown(ChannelError::ChannelClosed).await;
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        // Every handle dropped.
                        self.shutdown(ChannelError::ChannelClosed).await;
                        return;
                    }
                },
                inbound = self.response_link.recv() => match inbound {
                    Ok(Some(message)) => self.handle_response(message),
                    Ok(None) => {
                        warn!(channel = %self.name, "Response link closed by remote");
                        self.shutdown(ChannelError::RemoteClosed).await;
                        return;
                    }
                    Err(e) => {
                        warn!(channel = %self.name, error = %e, "Response link failed");
                        self.shutdown(e).await;
                        return;
                    }
                },
            }
        }
    }

    async fn handle_request(
        &mut self,
        mut message: Message,
        respond: oneshot::Sender<Result<Message>>,
    ) {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        message.message_id = Some(request_id);
        message.reply_to = Some(self.reply_to.clone());

        // One credit per outbound request bounds memory on the reply side.
        self.response_link.flow(1);

        match self.request_link.send(message).await {
            Ok(()) => {
                self.inflight.insert(request_id, respond);
                debug!(channel = %self.name, request_id, "Request dispatched");
            }
            Err(e) => {
                let _ = respond.send(Err(e));
            }
        }
    }

    fn handle_response(&mut self, message: Message) {
        let correlation_id = match message.correlation_id {
            Some(id) => id,
            None => {
                debug!(channel = %self.name, "Dropping uncorrelated response");
                return;
            }
        };

        match self.inflight.remove(&correlation_id) {
            Some(respond) => {
                let _ = respond.send(Ok(message));
            }
            None => {
                debug!(
                    channel = %self.name,
                    correlation_id,
                    "Dropping response with no matching request"
                );
            }
        }
    }

    /// Close both links, resolve every pending request with `error`, and
    /// publish the terminal state.
    async fn shutdown(&mut self, error: ChannelError) {
        self.request_link.close().await;
        self.response_link.close().await;

        let pending = self.inflight.len();
        for (_, respond) in self.inflight.drain() {
            let _ = respond.send(Err(error.clone()));
        }
        if pending > 0 {
            info!(channel = %self.name, pending, "Resolved pending requests on close");
        }

        self.publish_state();
        info!(channel = %self.name, "Request/response channel closed");
    }

    fn publish_state(&self) {
        let state = ChannelState::derive(self.request_link.state(), self.response_link.state());
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}
