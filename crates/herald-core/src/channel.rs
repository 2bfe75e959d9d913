//! Channel abstraction for Herald.
//!
//! A channel holds every live connection of one subscriber key and fans
//! pushed messages out to them.
//!
//! All connection-set mutations and the whole of each push run under a
//! single async mutex. A push therefore reaches exactly the connections
//! attached when it took the lock, and ids are strictly increasing.
//!
//! # Backpressure
//!
//! A push enqueues onto each connection's bounded outbound queue
//! ([`ChannelConfig::message_buffer`]) while holding the lock. When one
//! connection's queue is full the push waits for its writer, and every other
//! operation on the channel waits with it. A client that stops reading can
//! absorb `message_buffer` messages before it stalls its channel; the stall
//! lasts until the transport's own write timeout fails the writer or the
//! disconnect path removes the connection.

use bytes::Bytes;
use herald_protocol::{codec, ProtocolError, ProtocolVersion, PushFrame, HEARTBEAT_REPLY};
use herald_transport::Transport;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, PermitAll};
use crate::connection::Connection;
use crate::connection_set::{ConnectionHandle, ConnectionSet};
use crate::error::ChannelError;
use crate::message::{Message, MessageId, MessageSequence};
use crate::stats::ConnStats;
use crate::store::MessageStore;

/// Maximum subscriber key length.
pub const MAX_KEY_LENGTH: usize = 256;

/// Validate a subscriber key.
///
/// # Errors
///
/// Returns an error message if the key is invalid.
pub fn validate_key(key: &str) -> Result<(), &'static str> {
    if key.is_empty() {
        return Err("Subscriber key cannot be empty");
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err("Subscriber key too long");
    }
    if key.chars().any(char::is_control) {
        return Err("Subscriber key contains invalid characters");
    }
    Ok(())
}

/// Channel limits.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum connections attached to one key.
    pub max_subscribers_per_channel: usize,
    /// Outbound queue capacity per connection.
    pub message_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_subscribers_per_channel: 64,
            message_buffer: 64,
        }
    }
}

/// Per-push memo of the two encodings.
struct Encodings<'a> {
    frame: &'a PushFrame,
    legacy: Option<Bytes>,
    current: Option<Bytes>,
}

impl<'a> Encodings<'a> {
    fn new(frame: &'a PushFrame) -> Self {
        Self {
            frame,
            legacy: None,
            current: None,
        }
    }

    fn get(&mut self, version: ProtocolVersion) -> Result<Bytes, ProtocolError> {
        let slot = match version {
            ProtocolVersion::Legacy => &mut self.legacy,
            ProtocolVersion::Current => &mut self.current,
        };
        if let Some(data) = slot.as_ref() {
            return Ok(data.clone());
        }
        let data = codec::encode(self.frame, version)?;
        *slot = Some(data.clone());
        Ok(data)
    }
}

/// State guarded by the channel mutex.
struct ChannelInner {
    connections: ConnectionSet<Connection>,
    sequence: MessageSequence,
}

/// All live connections of one subscriber key.
pub struct Channel {
    inner: Mutex<ChannelInner>,
    config: ChannelConfig,
    store: Arc<dyn MessageStore>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<ConnStats>,
}

impl Channel {
    /// Create a channel persisting private messages through `store`.
    #[must_use]
    pub fn new(config: ChannelConfig, store: Arc<dyn MessageStore>) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                connections: ConnectionSet::new(),
                sequence: MessageSequence::new(),
            }),
            config,
            store,
            auth: Arc::new(PermitAll),
            stats: Arc::new(ConnStats::new()),
        }
    }

    /// Use `auth` for token checks.
    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Record connection counts into shared `stats`.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<ConnStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Issue message ids from `sequence`.
    #[must_use]
    pub fn with_sequence(mut self, sequence: MessageSequence) -> Self {
        self.inner.get_mut().sequence = sequence;
        self
    }

    /// Get the channel limits.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of attached connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    /// Check if no connection is attached.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.connections.is_empty()
    }

    /// The id of the most recent push.
    pub async fn last_message_id(&self) -> MessageId {
        self.inner.lock().await.sequence.last()
    }

    /// Register an authentication token for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the authenticator rejects the token.
    pub fn add_token(&self, key: &str, token: &str) -> Result<(), ChannelError> {
        self.auth.add_token(key, token)
    }

    /// Check an authentication token for `key`.
    #[must_use]
    pub fn auth_token(&self, key: &str, token: &str) -> bool {
        self.auth.auth_token(key, token)
    }

    /// Attach a connection.
    ///
    /// The heartbeat reply is written before the connection becomes visible
    /// to pushes. On success the connection's queue and writer are running
    /// and the returned handle detaches it again via [`Channel::remove_conn`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::CapacityExceeded`] if the channel is full
    /// (nothing is written), or [`ChannelError::Transport`] if the heartbeat
    /// write fails (the connection is left unattached).
    pub async fn add_conn(
        &self,
        key: &str,
        transport: Arc<dyn Transport>,
        version: impl Into<String>,
    ) -> Result<ConnectionHandle, ChannelError> {
        let mut inner = self.inner.lock().await;

        let max = self.config.max_subscribers_per_channel;
        if inner.connections.len() + 1 > max {
            warn!(key = %key, max, "Subscriber limit reached, rejecting connection");
            return Err(ChannelError::CapacityExceeded { max });
        }

        if let Err(e) = transport
            .write(key, Bytes::from_static(HEARTBEAT_REPLY))
            .await
        {
            error!(key = %key, error = %e, "Failed to write first heartbeat");
            return Err(e.into());
        }

        let conn = Connection::attach(key, transport, version.into(), self.config.message_buffer);
        let version = conn.version().to_string();
        let handle = inner.connections.push_back(conn);
        let count = inner.connections.len();
        drop(inner);

        self.stats.incr_add();
        info!(key = %key, version = %version, connections = count, "Connection added");
        Ok(handle)
    }

    /// Detach the connection identified by `handle`.
    ///
    /// Closes its outbound queue, which ends its writer. Each handle must be
    /// removed at most once.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AssertionFailed`] if `handle` does not name a
    /// connection of this channel.
    pub async fn remove_conn(&self, key: &str, handle: ConnectionHandle) -> Result<(), ChannelError> {
        let (removed, count) = {
            let mut inner = self.inner.lock().await;
            let removed = inner.connections.remove(handle);
            (removed, inner.connections.len())
        };

        let Some(conn) = removed else {
            error!(key = %key, ?handle, "Handle does not name an attached connection");
            return Err(ChannelError::AssertionFailed(
                "handle does not name an attached connection",
            ));
        };

        conn.close_queue();
        self.stats.incr_remove();
        info!(key = %key, connections = count, "Connection removed");
        Ok(())
    }

    /// Push `message` to every attached connection.
    ///
    /// Assigns the message id, persists the message first when `expire > 0`,
    /// then enqueues the legacy or current encoding onto each connection in
    /// attach order. Each encoding is computed at most once per push.
    ///
    /// # Errors
    ///
    /// A persistence failure aborts the push before any delivery. An encoding
    /// failure aborts the fan-out at the first connection needing that
    /// encoding; connections earlier in the order keep what was enqueued.
    pub async fn push_msg(
        &self,
        key: &str,
        message: &mut Message,
        expire: u32,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().await;

        message.id = inner.sequence.next_id();
        message.expire = expire;

        if expire > 0 {
            if let Err(e) = self
                .store
                .save_private_message(key, &message.payload, message.id, expire)
                .await
            {
                drop(inner);
                error!(key = %key, id = message.id, expire, error = %e, "Failed to save private message");
                return Err(e.into());
            }
        }

        let frame = message.to_frame();
        let mut encodings = Encodings::new(&frame);
        let shared_key: Arc<str> = Arc::from(key);
        let mut delivered = 0usize;

        for conn in inner.connections.iter() {
            let data = encodings.get(conn.protocol()).map_err(|e| {
                warn!(key = %key, id = message.id, protocol = %conn.protocol(), error = %e, "Failed to encode message");
                e
            })?;

            if conn.enqueue(&shared_key, data).await {
                delivered += 1;
            } else {
                warn!(key = %key, id = message.id, "Connection writer gone, message not queued");
            }
        }
        drop(inner);

        debug!(key = %key, id = message.id, expire, recipients = delivered, "Pushed message");
        Ok(())
    }

    /// Close every attached connection's transport.
    ///
    /// Close failures are logged and skipped. The connections stay attached
    /// until their disconnect path removes them.
    pub async fn close(&self) -> Result<(), ChannelError> {
        let inner = self.inner.lock().await;
        for conn in inner.connections.iter() {
            if let Err(e) = conn.close_transport().await {
                warn!(error = %e, "Failed to close connection");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PersistenceError, StoredMessage};
    use async_trait::async_trait;
    use herald_protocol::{decode_current, decode_legacy};
    use herald_transport::TransportError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{mpsc, Semaphore};

    /// Transport recording every write on an unbounded channel.
    struct MockTransport {
        writes: mpsc::UnboundedSender<Bytes>,
        fail_writes: AtomicBool,
        fail_close: bool,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn write(&self, _key: &str, data: Bytes) -> Result<(), TransportError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::SendFailed("broken pipe".into()));
            }
            let _ = self.writes.send(data);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(TransportError::ConnectionClosed);
            }
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    struct Client {
        transport: Arc<MockTransport>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl Client {
        fn new() -> Self {
            Self::build(false, false)
        }

        fn build(fail_writes: bool, fail_close: bool) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                transport: Arc::new(MockTransport {
                    writes: tx,
                    fail_writes: AtomicBool::new(fail_writes),
                    fail_close,
                    closes: AtomicUsize::new(0),
                }),
                rx,
            }
        }

        fn transport(&self) -> Arc<dyn Transport> {
            self.transport.clone()
        }

        async fn next(&mut self) -> Bytes {
            tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for a write")
                .expect("transport dropped")
        }

        async fn expect_heartbeat(&mut self) {
            assert_eq!(&self.next().await[..], HEARTBEAT_REPLY);
        }
    }

    /// Store that always fails to save.
    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save_private_message(
            &self,
            _key: &str,
            _payload: &Bytes,
            _id: MessageId,
            _expire: u32,
        ) -> Result<(), PersistenceError> {
            Err(PersistenceError::Save("disk full".into()))
        }

        async fn get_private_messages(
            &self,
            _key: &str,
            _after: MessageId,
        ) -> Result<Vec<StoredMessage>, PersistenceError> {
            Err(PersistenceError::Get("disk full".into()))
        }
    }

    /// Authenticator accepting only tokens registered through `add_token`.
    #[derive(Default)]
    struct TokenList {
        tokens: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl Authenticator for TokenList {
        fn add_token(&self, key: &str, token: &str) -> Result<(), ChannelError> {
            if token.is_empty() {
                return Err(ChannelError::Auth("empty token".into()));
            }
            self.tokens
                .lock()
                .unwrap()
                .push((key.to_string(), token.to_string()));
            Ok(())
        }

        fn auth_token(&self, key: &str, token: &str) -> bool {
            self.tokens
                .lock()
                .unwrap()
                .iter()
                .any(|(k, t)| k == key && t == token)
        }
    }

    fn channel(max: usize) -> Channel {
        let config = ChannelConfig {
            max_subscribers_per_channel: max,
            message_buffer: 8,
        };
        Channel::new(config, Arc::new(MemoryStore::new()))
            .with_sequence(MessageSequence::starting_after(1000))
    }

    fn json(payload: &str) -> Message {
        Message::new(payload.to_string())
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("user:42").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("bad\nkey").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[tokio::test]
    async fn test_capacity_scenario() {
        let stats = Arc::new(ConnStats::new());
        let channel = channel(2).with_stats(stats.clone());
        let mut a = Client::new();
        let mut b = Client::new();
        let mut c = Client::new();

        let handle_a = channel.add_conn("k", a.transport(), "1.0").await.unwrap();
        assert_eq!(channel.connection_count().await, 1);
        channel.add_conn("k", b.transport(), "").await.unwrap();
        assert_eq!(channel.connection_count().await, 2);

        let err = channel.add_conn("k", c.transport(), "1.0").await.unwrap_err();
        assert!(matches!(err, ChannelError::CapacityExceeded { max: 2 }));
        assert_eq!(channel.connection_count().await, 2);
        assert_eq!(stats.active(), 2);
        // The rejected client was never written to.
        assert!(c.rx.try_recv().is_err());

        a.expect_heartbeat().await;
        b.expect_heartbeat().await;

        let before = channel.last_message_id().await;
        let mut msg = json(r#"{"n":1}"#);
        channel.push_msg("k", &mut msg, 0).await.unwrap();
        assert_eq!(msg.id, before + 1);

        assert_eq!(decode_current(&a.next().await).unwrap().id, msg.id);
        assert_eq!(decode_legacy(&b.next().await).unwrap().id, msg.id);

        channel.remove_conn("k", handle_a).await.unwrap();
        assert_eq!(stats.active(), 1);

        let mut msg = json(r#"{"n":2}"#);
        channel.push_msg("k", &mut msg, 0).await.unwrap();
        assert_eq!(decode_legacy(&b.next().await).unwrap().id, msg.id);
        assert!(a.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_heartbeat_leaves_connection_unattached() {
        let stats = Arc::new(ConnStats::new());
        let channel = channel(2).with_stats(stats.clone());
        let mut broken = Client::build(true, false);
        let mut healthy = Client::new();

        let err = channel
            .add_conn("k", broken.transport(), "1.0")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)));
        assert_eq!(channel.connection_count().await, 0);
        assert_eq!(stats.active(), 0);

        // A push after the failure only reaches attached connections.
        channel.add_conn("k", healthy.transport(), "1.0").await.unwrap();
        healthy.expect_heartbeat().await;
        channel.push_msg("k", &mut json("{}"), 0).await.unwrap();
        healthy.next().await;
        assert!(broken.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_persistence_failure_delivers_nothing() {
        let channel = Channel::new(ChannelConfig::default(), Arc::new(FailingStore));
        let mut a = Client::new();
        let mut b = Client::new();
        channel.add_conn("k", a.transport(), "1.0").await.unwrap();
        channel.add_conn("k", b.transport(), "").await.unwrap();
        a.expect_heartbeat().await;
        b.expect_heartbeat().await;

        let err = channel
            .push_msg("k", &mut json(r#"{"lost":true}"#), 60)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Persistence(PersistenceError::Save(_))
        ));

        // An ephemeral push still works and is the first thing delivered.
        let mut next = json(r#"{"ok":true}"#);
        channel.push_msg("k", &mut next, 0).await.unwrap();
        assert_eq!(decode_current(&a.next().await).unwrap().id, next.id);
        assert_eq!(decode_legacy(&b.next().await).unwrap().id, next.id);
    }

    #[tokio::test]
    async fn test_persisted_before_delivery() {
        let store = Arc::new(MemoryStore::new());
        let channel = Channel::new(ChannelConfig::default(), store.clone());
        let mut a = Client::new();
        channel.add_conn("k", a.transport(), "1.0").await.unwrap();
        a.expect_heartbeat().await;

        let mut msg = json(r#"{"offline":1}"#);
        channel.push_msg("k", &mut msg, 60).await.unwrap();
        assert_eq!(msg.expire, 60);

        let stored = store.get_private_messages("k", 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, msg.id);
        assert_eq!(decode_current(&a.next().await).unwrap().id, msg.id);
    }

    #[tokio::test]
    async fn test_ephemeral_push_skips_store() {
        let channel = Channel::new(ChannelConfig::default(), Arc::new(FailingStore));
        let mut a = Client::new();
        channel.add_conn("k", a.transport(), "").await.unwrap();
        a.expect_heartbeat().await;

        channel.push_msg("k", &mut json("{}"), 0).await.unwrap();
        a.next().await;
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let channel = channel(4);
        let mut last = 0;
        for _ in 0..20 {
            let mut msg = json("{}");
            channel.push_msg("k", &mut msg, 0).await.unwrap();
            assert!(msg.id > last);
            last = msg.id;
        }
        assert_eq!(channel.last_message_id().await, last);
    }

    #[tokio::test]
    async fn test_with_sequence_sets_next_id() {
        let channel = channel(4);
        assert_eq!(channel.last_message_id().await, 1000);

        let mut msg = json("{}");
        channel.push_msg("k", &mut msg, 0).await.unwrap();
        assert_eq!(msg.id, 1001);
    }

    #[tokio::test]
    async fn test_encoding_selected_per_connection() {
        let channel = channel(4);
        let mut legacy = Client::new();
        let mut current = Client::new();
        channel.add_conn("k", legacy.transport(), "").await.unwrap();
        channel.add_conn("k", current.transport(), "2.1").await.unwrap();
        legacy.expect_heartbeat().await;
        current.expect_heartbeat().await;

        let mut msg = json(r#"{"title":"hi"}"#);
        channel.push_msg("k", &mut msg, 0).await.unwrap();

        let old = legacy.next().await;
        let new = current.next().await;
        let old_value: serde_json::Value = serde_json::from_slice(&old).unwrap();
        assert_eq!(old_value["msg"], r#"{"title":"hi"}"#);
        let new_value: serde_json::Value = serde_json::from_slice(&new).unwrap();
        assert_eq!(new_value["msg"]["title"], "hi");

        let old_frame = decode_legacy(&old).unwrap();
        let new_frame = decode_current(&new).unwrap();
        assert_eq!(old_frame.id, new_frame.id);
        assert_eq!(old_frame.payload, new_frame.payload);
    }

    #[tokio::test]
    async fn test_encode_failure_keeps_earlier_deliveries() {
        let channel = channel(4);
        let mut legacy = Client::new();
        let mut current = Client::new();
        channel.add_conn("k", legacy.transport(), "").await.unwrap();
        channel.add_conn("k", current.transport(), "1.0").await.unwrap();
        legacy.expect_heartbeat().await;
        current.expect_heartbeat().await;

        // Valid UTF-8 but not JSON: legacy can carry it, current cannot.
        let err = channel
            .push_msg("k", &mut json("plain text"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Encode(_)));

        let delivered = decode_legacy(&legacy.next().await).unwrap();
        assert_eq!(&delivered.payload[..], b"plain text");
        assert!(current.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_twice_is_assertion_failure() {
        let channel = channel(4);
        let a = Client::new();
        let handle = channel.add_conn("k", a.transport(), "").await.unwrap();

        channel.remove_conn("k", handle).await.unwrap();
        let err = channel.remove_conn("k", handle).await.unwrap_err();
        assert!(matches!(err, ChannelError::AssertionFailed(_)));
    }

    #[tokio::test]
    async fn test_foreign_handle_is_assertion_failure() {
        let first = channel(4);
        let second = channel(4);
        let a = Client::new();
        let b = Client::new();
        let handle = first.add_conn("k", a.transport(), "").await.unwrap();
        second.add_conn("k", b.transport(), "").await.unwrap();

        assert!(matches!(
            second.remove_conn("k", handle).await,
            Err(ChannelError::AssertionFailed(_))
        ));
        assert_eq!(second.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_close_skips_removed_and_ignores_errors() {
        let channel = channel(4);
        let removed = Client::new();
        let failing = Client::build(false, true);
        let healthy = Client::new();

        let handle = channel.add_conn("k", removed.transport(), "").await.unwrap();
        channel.add_conn("k", failing.transport(), "").await.unwrap();
        channel.add_conn("k", healthy.transport(), "").await.unwrap();
        channel.remove_conn("k", handle).await.unwrap();

        channel.close().await.unwrap();
        assert_eq!(removed.transport.closes.load(Ordering::SeqCst), 0);
        assert_eq!(failing.transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.transport.closes.load(Ordering::SeqCst), 1);
        // Close leaves membership to the disconnect path.
        assert_eq!(channel.connection_count().await, 2);
    }

    /// Transport whose writes wait for a permit.
    struct GatedTransport {
        gate: Semaphore,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn write(&self, _key: &str, _data: Bytes) -> Result<(), TransportError> {
            self.gate
                .acquire()
                .await
                .map_err(|_| TransportError::ConnectionClosed)?
                .forget();
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_full_queue_blocks_channel() {
        let config = ChannelConfig {
            max_subscribers_per_channel: 4,
            message_buffer: 1,
        };
        let channel = Arc::new(Channel::new(config, Arc::new(MemoryStore::new())));
        // One permit for the first heartbeat, then the client stalls.
        let stalled = Arc::new(GatedTransport {
            gate: Semaphore::new(1),
        });
        channel.add_conn("k", stalled.clone(), "1.0").await.unwrap();

        let pushed = Arc::new(AtomicUsize::new(0));
        let pusher = {
            let channel = Arc::clone(&channel);
            let pushed = Arc::clone(&pushed);
            tokio::spawn(async move {
                for _ in 0..5 {
                    channel.push_msg("k", &mut json("{}"), 0).await.unwrap();
                    pushed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        // At most one message in the writer and one in the queue.
        assert!(pushed.load(Ordering::SeqCst) <= 2);
        // The stalled push holds the channel lock.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), channel.connection_count())
                .await
                .is_err()
        );

        stalled.gate.add_permits(16);
        tokio::time::timeout(Duration::from_secs(1), pusher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 5);
        assert_eq!(channel.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_tokens_delegate_to_authenticator() {
        let permissive = channel(1);
        assert!(permissive.add_token("k", "t").is_ok());
        assert!(permissive.auth_token("k", "anything"));

        let strict = channel(1).with_authenticator(Arc::new(TokenList::default()));
        assert!(!strict.auth_token("k", "t"));
        strict.add_token("k", "t").unwrap();
        assert!(strict.auth_token("k", "t"));
        assert!(matches!(
            strict.add_token("k", ""),
            Err(ChannelError::Auth(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_respects_limit() {
        let channel = Arc::new(channel(5));
        let mut tasks = Vec::new();
        let mut clients = Vec::new();

        for _ in 0..20 {
            let client = Client::new();
            let transport = client.transport();
            clients.push(client);
            let channel = Arc::clone(&channel);
            tasks.push(tokio::spawn(async move {
                channel.add_conn("k", transport, "1.0").await
            }));
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(ChannelError::CapacityExceeded { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(accepted, 5);
        assert_eq!(rejected, 15);
        assert_eq!(channel.connection_count().await, 5);
    }
}
