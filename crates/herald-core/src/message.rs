//! Message types for Herald.

use bytes::Bytes;
use herald_protocol::PushFrame;
use std::time::{SystemTime, UNIX_EPOCH};

/// A message identifier, unique and increasing within one channel.
pub type MessageId = u64;

/// A message pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identifier assigned by the channel at push time (0 until pushed).
    pub id: MessageId,
    /// Opaque payload.
    pub payload: Bytes,
    /// Expiry hint in seconds (0 = ephemeral, never persisted).
    pub expire: u32,
    /// Message group (0 for private messages).
    pub group_id: u32,
}

impl Message {
    /// Create a new, not yet pushed message.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: 0,
            payload: payload.into(),
            expire: 0,
            group_id: 0,
        }
    }

    /// Create a message in a group.
    #[must_use]
    pub fn with_group(mut self, group_id: u32) -> Self {
        self.group_id = group_id;
        self
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// The encoding-independent wire frame for this message.
    #[must_use]
    pub fn to_frame(&self) -> PushFrame {
        PushFrame::new(self.id, self.payload.clone())
            .with_expire(self.expire)
            .with_group(self.group_id)
    }
}

/// Per-channel message id generator.
///
/// Seeded from the wall clock so ids stay ahead of those handed out by a
/// previous incarnation of the channel; afterwards every id is exactly one
/// more than the last.
#[derive(Debug, Clone)]
pub struct MessageSequence {
    last: MessageId,
}

impl MessageSequence {
    /// Create a sequence seeded from the current time in microseconds.
    #[must_use]
    pub fn new() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        Self::starting_after(micros)
    }

    /// Create a sequence whose first id is `last + 1`.
    #[must_use]
    pub fn starting_after(last: MessageId) -> Self {
        Self { last }
    }

    /// The most recently issued id.
    #[must_use]
    pub fn last(&self) -> MessageId {
        self.last
    }

    /// Issue the next id.
    pub fn next_id(&mut self) -> MessageId {
        self.last += 1;
        self.last
    }
}

impl Default for MessageSequence {
    fn default() -> Self {
        Self::new()
    }
}
