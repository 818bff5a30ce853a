//! Channel Messages
//!
//! The unit exchanged over a request/response channel. The channel assigns
//! `message_id` and `reply_to` on the way out; a reply carries the request's
//! id in `correlation_id`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request or reply message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the channel when the message is sent as a request.
    pub message_id: Option<u64>,

    /// For replies: the `message_id` of the request being answered.
    pub correlation_id: Option<u64>,

    /// Private reply address, stamped by the channel on outbound requests.
    pub reply_to: Option<String>,

    /// Operation name, status codes, and other string metadata.
    pub properties: HashMap<String, String>,

    /// Payload.
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            correlation_id: None,
            reply_to: None,
            properties: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build a reply to `request`, correlated by its message id.
    pub fn reply_to_request(request: &Message, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            correlation_id: request.message_id,
            reply_to: None,
            properties: HashMap::new(),
            body: body.into(),
        }
    }
}
