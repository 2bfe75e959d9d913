//! Private message persistence.
//!
//! A channel persists a message before delivering it whenever the push
//! carries an expiry, so subscribers that are offline can fetch it later.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::message::MessageId;

/// Default number of messages retained per key by [`MemoryStore`].
pub const DEFAULT_MAX_MESSAGES_PER_KEY: usize = 128;

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    /// Storing a message failed.
    #[error("Message save failed: {0}")]
    Save(String),

    /// Loading messages failed.
    #[error("Message get failed: {0}")]
    Get(String),

    /// No storage backend is configured.
    #[error("Message RPC not initialized")]
    Rpc,
}

/// A persisted private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Message id.
    pub id: MessageId,
    /// Payload.
    pub payload: Bytes,
}

/// Durable storage for private messages.
///
/// Implementations are shared by every channel and must tolerate concurrent
/// calls.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store `payload` for `key` under `id`, expiring after `expire` seconds.
    async fn save_private_message(
        &self,
        key: &str,
        payload: &Bytes,
        id: MessageId,
        expire: u32,
    ) -> Result<(), PersistenceError>;

    /// Load the unexpired messages for `key` with ids greater than `after`,
    /// oldest first.
    async fn get_private_messages(
        &self,
        key: &str,
        after: MessageId,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;
}

/// Store used when persistence is not configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledStore;

#[async_trait]
impl MessageStore for DisabledStore {
    async fn save_private_message(
        &self,
        _key: &str,
        _payload: &Bytes,
        _id: MessageId,
        _expire: u32,
    ) -> Result<(), PersistenceError> {
        Err(PersistenceError::Rpc)
    }

    async fn get_private_messages(
        &self,
        _key: &str,
        _after: MessageId,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        Err(PersistenceError::Rpc)
    }
}

#[derive(Debug)]
struct Entry {
    payload: Bytes,
    expires_at: Instant,
}

/// In-process message store with per-message expiry.
///
/// Holds at most `max_per_key` messages per key; the oldest are dropped
/// first.
#[derive(Debug)]
pub struct MemoryStore {
    messages: DashMap<String, BTreeMap<MessageId, Entry>>,
    max_per_key: usize,
}

impl MemoryStore {
    /// Create a store with the default per-key limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_MESSAGES_PER_KEY)
    }

    /// Create a store keeping at most `max_per_key` messages per key.
    #[must_use]
    pub fn with_limit(max_per_key: usize) -> Self {
        Self {
            messages: DashMap::new(),
            max_per_key: max_per_key.max(1),
        }
    }

    /// Number of stored messages for `key`, expired ones included.
    #[must_use]
    pub fn len(&self, key: &str) -> usize {
        self.messages.get(key).map(|m| m.len()).unwrap_or(0)
    }

    /// Drop every expired message. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;

        for mut entry in self.messages.iter_mut() {
            let before = entry.len();
            entry.retain(|_, e| e.expires_at > now);
            purged += before - entry.len();
        }
        self.messages.retain(|_, m| !m.is_empty());

        if purged > 0 {
            debug!(purged, "Purged expired private messages");
        }
        purged
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_private_message(
        &self,
        key: &str,
        payload: &Bytes,
        id: MessageId,
        expire: u32,
    ) -> Result<(), PersistenceError> {
        if expire == 0 {
            return Err(PersistenceError::Save("expire must be positive".into()));
        }

        let expires_at = Instant::now() + Duration::from_secs(u64::from(expire));
        let mut messages = self.messages.entry(key.to_string()).or_default();
        messages.insert(
            id,
            Entry {
                payload: payload.clone(),
                expires_at,
            },
        );
        while messages.len() > self.max_per_key {
            messages.pop_first();
        }

        trace!(key = %key, id, expire, "Saved private message");
        Ok(())
    }

    async fn get_private_messages(
        &self,
        key: &str,
        after: MessageId,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let now = Instant::now();
        let Some(messages) = self.messages.get(key) else {
            return Ok(Vec::new());
        };

        Ok(messages
            .range(after.saturating_add(1)..)
            .filter(|(_, e)| e.expires_at > now)
            .map(|(id, e)| StoredMessage {
                id: *id,
                payload: e.payload.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_get() {
        let store = MemoryStore::new();
        let payload = Bytes::from_static(b"{}");

        store.save_private_message("alice", &payload, 1, 60).await.unwrap();
        store.save_private_message("alice", &payload, 2, 60).await.unwrap();
        store.save_private_message("bob", &payload, 3, 60).await.unwrap();

        let all = store.get_private_messages("alice", 0).await.unwrap();
        assert_eq!(all.iter().map(|m| m.id).collect::<Vec<_>>(), [1, 2]);

        let newer = store.get_private_messages("alice", 1).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, 2);

        assert!(store.get_private_messages("carol", 0).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        let payload = Bytes::from_static(b"{}");

        store.save_private_message("alice", &payload, 1, 10).await.unwrap();
        store.save_private_message("alice", &payload, 2, 60).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;

        let live = store.get_private_messages("alice", 0).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, 2);

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len("alice"), 1);
    }

    #[tokio::test]
    async fn test_per_key_limit_drops_oldest() {
        let store = MemoryStore::with_limit(2);
        let payload = Bytes::from_static(b"{}");

        for id in 1..=3 {
            store.save_private_message("alice", &payload, id, 60).await.unwrap();
        }

        let kept = store.get_private_messages("alice", 0).await.unwrap();
        assert_eq!(kept.iter().map(|m| m.id).collect::<Vec<_>>(), [2, 3]);
    }

    #[tokio::test]
    async fn test_disabled_store() {
        let store = DisabledStore;
        let payload = Bytes::from_static(b"{}");
        assert_eq!(
            store.save_private_message("alice", &payload, 1, 60).await,
            Err(PersistenceError::Rpc)
        );
        assert_eq!(
            store.get_private_messages("alice", 0).await,
            Err(PersistenceError::Rpc)
        );
    }
}
