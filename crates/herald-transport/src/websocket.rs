//! WebSocket transport implementation.
//!
//! This module provides the subscriber-facing WebSocket listener using
//! tokio-tungstenite. Subscribers connect to
//! `ws://host:port/sub?key=<key>&ver=<tag>&token=<token>&heartbeat=<secs>`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use herald_protocol::codec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Error as WsError, Message,
    },
    WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::traits::{ConnectionId, Transport, TransportError};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// How long one outbound frame may take before the connection is
    /// considered dead.
    pub write_timeout: Duration,
    /// How long a client may take to complete the upgrade request.
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8090)),
            max_message_size: 4 * 1024, // 4 KB; clients only send heartbeats
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Subscription parameters carried in the upgrade request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeParams {
    /// Subscriber key.
    pub key: String,
    /// Protocol-version tag (empty for legacy clients).
    pub version: String,
    /// Authentication token, if any.
    pub token: Option<String>,
    /// Client heartbeat interval in seconds, if announced.
    pub heartbeat: Option<u64>,
}

impl SubscribeParams {
    /// Parse parameters from a URL query string.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or empty.
    pub fn from_query(query: &str) -> Result<Self, TransportError> {
        let mut key = None;
        let mut version = String::new();
        let mut token = None;
        let mut heartbeat = None;

        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "key" => key = Some(value.into_owned()),
                "ver" => version = value.into_owned(),
                "token" => token = Some(value.into_owned()),
                "heartbeat" => heartbeat = value.parse().ok(),
                _ => {}
            }
        }

        let key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| TransportError::Handshake("missing subscriber key".into()))?;

        Ok(Self {
            key,
            version,
            token,
            heartbeat,
        })
    }
}

/// WebSocket listener for subscribers.
pub struct WebSocketListener {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketListener {
    /// Create a new WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket listener bound to {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket listener with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept the next TCP connection.
    ///
    /// The WebSocket upgrade is left to [`PendingConnection::handshake`] so
    /// that a slow client never holds up the accept loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP accept fails.
    pub async fn accept(&self) -> Result<PendingConnection, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        Ok(PendingConnection {
            stream,
            remote_addr: addr,
            config: self.config.clone(),
        })
    }
}

/// A TCP connection that has not completed the WebSocket upgrade yet.
pub struct PendingConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    config: WebSocketConfig,
}

impl PendingConnection {
    /// Get the peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Run the WebSocket upgrade and parse the subscription parameters.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the client does not finish
    /// the upgrade within the configured handshake timeout, or
    /// [`TransportError::Handshake`] if the upgrade or the parameters are
    /// invalid.
    pub async fn handshake(self) -> Result<WebSocketConnection, TransportError> {
        let addr = self.remote_addr;
        let mut query = String::new();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().unwrap_or_default().to_string();
            Ok(resp)
        };

        let upgrade = tokio::time::timeout(
            self.config.handshake_timeout,
            accept_hdr_async(self.stream, callback),
        )
        .await;
        let mut ws_stream = match upgrade {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
            Err(_) => {
                debug!(remote = %addr, "WebSocket handshake timed out");
                return Err(TransportError::Timeout);
            }
        };

        let params = match SubscribeParams::from_query(&query) {
            Ok(params) => params,
            Err(e) => {
                warn!(remote = %addr, error = %e, "Rejecting subscriber");
                let _ = ws_stream.close(None).await;
                return Err(e);
            }
        };

        debug!(remote = %addr, key = %params.key, "WebSocket handshake completed");

        Ok(WebSocketConnection {
            id: ConnectionId::generate(),
            params,
            remote_addr: addr,
            stream: ws_stream,
            max_message_size: self.config.max_message_size,
            write_timeout: self.config.write_timeout,
        })
    }
}

/// An accepted subscriber WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    params: SubscribeParams,
    remote_addr: SocketAddr,
    stream: WebSocketStream<TcpStream>,
    max_message_size: usize,
    write_timeout: Duration,
}

impl WebSocketConnection {
    /// Get the connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the subscription parameters.
    #[must_use]
    pub fn params(&self) -> &SubscribeParams {
        &self.params
    }

    /// Split into a shared writer and an owned reader.
    #[must_use]
    pub fn split(self) -> (Arc<WebSocketWriter>, WebSocketReader) {
        let (sink, stream) = self.stream.split();
        let writer = Arc::new(WebSocketWriter {
            id: self.id,
            sink: Mutex::new(sink),
            remote_addr: self.remote_addr,
            is_open: AtomicBool::new(true),
            write_timeout: self.write_timeout,
        });
        let reader = WebSocketReader {
            id: self.id,
            stream,
            max_message_size: self.max_message_size,
        };
        (writer, reader)
    }
}

/// Write half of a subscriber connection.
pub struct WebSocketWriter {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>,
    remote_addr: SocketAddr,
    is_open: AtomicBool,
    write_timeout: Duration,
}

impl WebSocketWriter {
    /// Get the connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

#[async_trait]
impl Transport for WebSocketWriter {
    async fn write(&self, key: &str, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        // Both encodings are JSON, so text frames are the norm.
        let message = match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };

        let mut sink = self.sink.lock().await;
        let sent = match tokio::time::timeout(self.write_timeout, sink.send(message)).await {
            Ok(sent) => sent,
            Err(_) => {
                debug!(key = %key, connection = %self.id, "WebSocket write timed out");
                self.is_open.store(false, Ordering::SeqCst);
                return Err(TransportError::Timeout);
            }
        };

        sent.map_err(|e| {
            debug!(key = %key, connection = %self.id, error = %e, "WebSocket write failed");
            match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    self.is_open.store(false, Ordering::SeqCst);
                    TransportError::ConnectionClosed
                }
                other => TransportError::SendFailed(other.to_string()),
            }
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        let mut sink = self.sink.lock().await;
        sink.close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}

/// Something a subscriber sent us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A client heartbeat.
    Heartbeat,
    /// Any other client message; the core ignores these.
    Data(Bytes),
    /// The connection was closed by the peer.
    Closed,
}

/// Read half of a subscriber connection.
pub struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WebSocketStream<TcpStream>>,
    max_message_size: usize,
}

impl WebSocketReader {
    /// Receive the next inbound message.
    ///
    /// Control frames are handled transparently.
    ///
    /// # Errors
    ///
    /// Returns an error on protocol violations or oversized messages.
    pub async fn recv(&mut self) -> Result<Inbound, TransportError> {
        loop {
            let data = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => Bytes::from(text),
                Some(Ok(Message::Binary(data))) => Bytes::from(data),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    return Ok(Inbound::Closed);
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    return Ok(Inbound::Closed);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            };

            if data.len() > self.max_message_size {
                warn!(
                    connection = %self.id,
                    "Message too large: {} bytes (max: {})",
                    data.len(),
                    self.max_message_size
                );
                return Err(TransportError::MessageTooLarge(
                    data.len(),
                    self.max_message_size,
                ));
            }

            if codec::is_heartbeat(&data) {
                return Ok(Inbound::Heartbeat);
            }
            return Ok(Inbound::Data(data));
        }
    }
}
