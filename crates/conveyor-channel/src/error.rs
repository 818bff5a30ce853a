//! Channel Error Types
//!
//! Errors are cloneable because a single link failure is broadcast to every
//! in-flight request.

use thiserror::Error;

/// Convenience type alias for `Result<T, ChannelError>`.
pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The request message was malformed (id or reply-to already set).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Opening the link pair failed.
    #[error("Open failed: {0}")]
    OpenFailed(String),

    /// Unrecoverable link-level failure.
    #[error("Link error: {0}")]
    Link(String),

    /// The remote side closed the link.
    #[error("Link closed by remote")]
    RemoteClosed,

    /// The channel is closed; no further requests are accepted.
    #[error("Channel closed")]
    ChannelClosed,
}
