//! # herald-transport
//!
//! Transport abstraction layer for Herald subscribers.
//!
//! The delivery core never touches sockets directly. It writes opaque,
//! already-encoded messages through the [`Transport`] trait, and the
//! transport is responsible for framing them.
//!
//! - **WebSocket** - each message is one text frame
//!
//! ```rust,ignore
//! use herald_transport::websocket::{WebSocketListener, Inbound};
//!
//! let conn = listener.accept().await?.handshake().await?;
//! let (writer, mut reader) = conn.split();
//! while let Ok(Inbound::Heartbeat) = reader.recv().await {
//!     writer.write(&key, Bytes::from_static(b"h")).await?;
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{ConnectionId, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{Inbound, PendingConnection, SubscribeParams, WebSocketConfig, WebSocketListener};
