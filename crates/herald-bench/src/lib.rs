//! Shared fixtures for Herald benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use herald_core::{Channel, ChannelConfig, ConnectionHandle, DisabledStore};
use herald_transport::{Transport, TransportError};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Subscriber key used by every benchmark.
pub const KEY: &str = "bench";

/// Transport that discards every write.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn write(&self, _key: &str, _data: Bytes) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Transport that forwards every write to a channel.
pub struct ForwardTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ForwardTransport {
    /// Create a transport and the receiver its writes arrive on.
    #[must_use]
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Transport for ForwardTransport {
    async fn write(&self, _key: &str, data: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(data)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A JSON string payload of roughly `size` bytes.
#[must_use]
pub fn sample_payload(size: usize) -> Bytes {
    let body = "x".repeat(size.saturating_sub(2));
    Bytes::from(format!("\"{}\"", body))
}

/// An ephemeral-only channel sized for `subscribers` connections.
#[must_use]
pub fn bench_channel(subscribers: usize) -> Channel {
    Channel::new(
        ChannelConfig {
            max_subscribers_per_channel: subscribers.max(1),
            message_buffer: 1024,
        },
        Arc::new(DisabledStore),
    )
}

/// Attach `count` discarding connections, alternating between `versions`.
pub async fn attach_null_subscribers(
    channel: &Channel,
    count: usize,
    versions: &[&str],
) -> Vec<ConnectionHandle> {
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let version = versions[i % versions.len()];
        match channel.add_conn(KEY, Arc::new(NullTransport), version).await {
            Ok(handle) => handles.push(handle),
            Err(e) => panic!("failed to attach benchmark subscriber: {}", e),
        }
    }
    handles
}
