//! Message bodies for the Herald wire protocol.
//!
//! A [`PushFrame`] is the logical message; [`LegacyBody`] and
//! [`CurrentBody`] are its two serialized shapes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A logical push message, independent of wire encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    /// Message id assigned by the owning channel.
    pub id: u64,
    /// Application payload.
    pub payload: Bytes,
    /// Expiry in seconds (0 for ephemeral messages).
    pub expire: u32,
    /// Message group (0 for private messages).
    pub group_id: u32,
}

impl PushFrame {
    /// Create a private message frame.
    #[must_use]
    pub fn new(id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
            expire: 0,
            group_id: 0,
        }
    }

    /// Set the expiry hint.
    #[must_use]
    pub fn with_expire(mut self, expire: u32) -> Self {
        self.expire = expire;
        self
    }

    /// Set the message group.
    #[must_use]
    pub fn with_group(mut self, group_id: u32) -> Self {
        self.group_id = group_id;
        self
    }
}

/// Legacy body: the payload travels as a JSON string.
#[derive(Debug, Serialize, Deserialize)]
pub struct LegacyBody<'a> {
    /// Payload text.
    #[serde(borrow)]
    pub msg: std::borrow::Cow<'a, str>,
    /// Expiry in seconds.
    pub expire: u32,
    /// Message id.
    pub mid: u64,
}

/// Current body: the payload is embedded verbatim as a JSON value.
#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentBody<'a> {
    /// Payload document.
    #[serde(borrow)]
    pub msg: &'a RawValue,
    /// Message id.
    pub mid: u64,
    /// Message group.
    pub gid: u32,
}
