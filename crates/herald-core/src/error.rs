//! Errors returned by channel operations.

use herald_protocol::ProtocolError;
use herald_transport::TransportError;
use thiserror::Error;

use crate::store::PersistenceError;

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel already holds its maximum number of subscribers.
    #[error("Subscriber limit reached ({max} connections)")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },

    /// Invalid subscriber key.
    #[error("Invalid subscriber key: {0}")]
    InvalidKey(&'static str),

    /// Persisting a private message failed; nothing was delivered.
    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),

    /// Writing to or closing a connection failed.
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The message cannot be carried by a connection's encoding.
    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    /// The authenticator rejected a token.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Internal invariant violated (e.g. a handle from another channel).
    #[error("Assertion failed: {0}")]
    AssertionFailed(&'static str),
}

impl ChannelError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::CapacityExceeded { .. } => "capacity",
            ChannelError::InvalidKey(_) => "invalid_key",
            ChannelError::Persistence(_) => "persistence",
            ChannelError::Transport(_) => "transport",
            ChannelError::Encode(_) => "encode",
            ChannelError::Auth(_) => "auth",
            ChannelError::AssertionFailed(_) => "assertion",
        }
    }
}
