//! # herald-core
//!
//! Per-subscriber delivery core for the Herald push server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Channel** - one subscriber key's live connections and push logic
//! - **ConnectionSet** - ordered arena of attached connections
//! - **MessageStore** - persistence of private messages for offline replay
//! - **Authenticator** - pluggable token policy (permissive by default)
//! - **ChannelRegistry** - key to channel map shared by the server
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Accept /   │────▶│  Registry   │────▶│  Channel    │
//! │  Push API   │     └─────────────┘     └──────┬──────┘
//! └─────────────┘                                │
//!                            ┌───────────────────┼───────────────┐
//!                            ▼                   ▼               ▼
//!                     ┌─────────────┐     ┌─────────────┐  ┌───────────┐
//!                     │MessageStore │     │ Connection  │─▶│ Transport │
//!                     └─────────────┘     │ (queue +    │  └───────────┘
//!                                         │  writer)    │
//!                                         └─────────────┘
//! ```

pub mod auth;
pub mod channel;
pub mod connection;
pub mod connection_set;
pub mod error;
pub mod message;
pub mod registry;
pub mod stats;
pub mod store;

pub use auth::{Authenticator, PermitAll};
pub use channel::{Channel, ChannelConfig};
pub use connection::Connection;
pub use connection_set::{ConnectionHandle, ConnectionSet};
pub use error::ChannelError;
pub use message::{Message, MessageId, MessageSequence};
pub use registry::{ChannelRegistry, RegistryStats};
pub use stats::ConnStats;
pub use store::{DisabledStore, MemoryStore, MessageStore, PersistenceError, StoredMessage};
