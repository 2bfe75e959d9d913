//! Per-connection delivery state.
//!
//! Every attached connection owns a bounded outbound queue and one writer
//! task draining it into the transport. Pushes only ever enqueue; socket
//! writes happen on the writer task.

use bytes::Bytes;
use herald_protocol::ProtocolVersion;
use herald_transport::{Transport, TransportError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// One queued message, tagged with the subscriber key it was pushed for.
#[derive(Debug)]
struct Outbound {
    key: Arc<str>,
    data: Bytes,
}

/// An attached client connection.
///
/// The outbound queue is closed exactly once, when the connection is taken
/// out of its channel and [`Connection::close_queue`] consumes it.
pub struct Connection {
    transport: Arc<dyn Transport>,
    version: String,
    protocol: ProtocolVersion,
    queue: mpsc::Sender<Outbound>,
}

impl Connection {
    /// Allocate the outbound queue and start the writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn attach(
        key: &str,
        transport: Arc<dyn Transport>,
        version: String,
        queue_capacity: usize,
    ) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(write_loop(key.to_string(), Arc::clone(&transport), rx));

        Self {
            protocol: ProtocolVersion::from_tag(&version),
            transport,
            version,
            queue,
        }
    }

    /// The protocol-version tag the client announced.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The encoding this connection receives.
    #[must_use]
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Enqueue an encoded message, waiting while the queue is full.
    ///
    /// Returns `false` if the writer has already exited.
    pub(crate) async fn enqueue(&self, key: &Arc<str>, data: Bytes) -> bool {
        self.queue
            .send(Outbound {
                key: Arc::clone(key),
                data,
            })
            .await
            .is_ok()
    }

    /// Close the underlying transport.
    pub(crate) async fn close_transport(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    /// Close the outbound queue, letting the writer drain and exit.
    pub(crate) fn close_queue(self) {
        drop(self.queue);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.version)
            .field("protocol", &self.protocol)
            .field("remote_addr", &self.transport.remote_addr())
            .finish()
    }
}

/// Drain the outbound queue into the transport until the queue is closed.
async fn write_loop(key: String, transport: Arc<dyn Transport>, mut rx: mpsc::Receiver<Outbound>) {
    let mut failed = false;

    while let Some(outbound) = rx.recv().await {
        if let Err(e) = transport.write(&outbound.key, outbound.data).await {
            // A failed connection keeps draining until it is removed.
            if failed {
                trace!(key = %key, error = %e, "Dropping message for failed connection");
            } else {
                warn!(key = %key, error = %e, "Connection write failed");
                failed = true;
            }
        }
    }

    debug!(key = %key, "Connection writer exited");
}
