//! Transport abstraction traits for Herald.
//!
//! These traits define the interface the delivery core writes through,
//! allowing it to stay transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, used to correlate log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw value.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The subscription handshake was rejected.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Inbound message exceeds the configured limit.
    #[error("Message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A writable, closable endpoint for one subscriber connection.
///
/// Implementations frame each write themselves and must serialize
/// concurrent writes internally: a connection's background writer and its
/// heartbeat replies share one transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one encoded message for the subscriber `key`.
    async fn write(&self, key: &str, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection. Best-effort; closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
