//! Subscriber connection lifecycle.
//!
//! A subscriber opens a WebSocket with its key, protocol version, token and
//! heartbeat interval in the query string. Once attached to its channel it
//! only sends heartbeats; anything else is ignored. The connection is
//! detached when the peer closes it, a read fails, or no heartbeat arrives
//! within twice the announced interval.

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use bytes::Bytes;
use herald_core::channel::validate_key;
use herald_protocol::HEARTBEAT_REPLY;
use herald_transport::{Inbound, PendingConnection, Transport, WebSocketConfig, WebSocketListener};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bind the subscriber endpoint and serve it until the listener fails.
///
/// # Errors
///
/// Returns an error if the endpoint cannot be bound.
pub async fn run_subscriber_listener(state: Arc<AppState>) -> Result<()> {
    let listener = WebSocketListener::new(WebSocketConfig {
        bind_addr: state.config.subscriber_addr()?,
        max_message_size: state.config.subscriber.max_message_size,
        write_timeout: Duration::from_secs(state.config.subscriber.write_timeout_secs.max(1)),
        handshake_timeout: Duration::from_secs(
            state.config.subscriber.handshake_timeout_secs.max(1),
        ),
    })
    .await?;

    if let Some(addr) = listener.local_addr() {
        info!("Subscriber endpoint: ws://{}/sub?key=<key>&ver=<version>", addr);
    }

    serve_subscribers(listener, state).await;
    Ok(())
}

/// Accept subscribers from `listener`, one task per connection.
///
/// The WebSocket upgrade runs inside the per-connection task.
pub async fn serve_subscribers(listener: WebSocketListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok(pending) => {
                tokio::spawn(handle_subscriber(pending, Arc::clone(&state)));
            }
            Err(e) => {
                error!(error = %e, "Subscriber accept failed");
                metrics::record_error("accept");
            }
        }
    }
}

/// Drive one subscriber from upgrade to detach.
async fn handle_subscriber(pending: PendingConnection, state: Arc<AppState>) {
    let remote = pending.remote_addr();
    let conn = match pending.handshake().await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(remote = %remote, error = %e, "Subscriber handshake failed");
            metrics::record_error("handshake");
            return;
        }
    };

    let connection_id = conn.id();
    let params = conn.params().clone();
    let key = params.key.as_str();
    let (writer, mut reader) = conn.split();

    // Rejected subscribers must not leave a channel behind.
    if let Err(reason) = validate_key(key) {
        warn!(connection = %connection_id, key = %key, reason, "Rejecting subscriber");
        metrics::record_error("invalid_key");
        let _ = writer.close().await;
        return;
    }

    let token = params.token.as_deref().unwrap_or_default();
    if !state.registry.authenticator().auth_token(key, token) {
        warn!(connection = %connection_id, key = %key, "Subscriber token rejected");
        metrics::record_error("auth");
        let _ = writer.close().await;
        return;
    }

    let channel = match state.registry.get_or_create(key) {
        Ok(channel) => channel,
        Err(e) => {
            warn!(connection = %connection_id, key = %key, error = %e, "Rejecting subscriber");
            metrics::record_error(e.kind());
            let _ = writer.close().await;
            return;
        }
    };

    let transport: Arc<dyn Transport> = writer.clone();
    let handle = match channel.add_conn(key, transport, params.version.as_str()).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(connection = %connection_id, key = %key, error = %e, "Failed to attach subscriber");
            metrics::record_error(e.kind());
            let _ = writer.close().await;
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    metrics::set_active_channels(state.registry.stats().channel_count);
    debug!(
        connection = %connection_id,
        key = %key,
        version = %params.version,
        "Subscriber attached"
    );

    let timeout = state.config.heartbeat.timeout_for(params.heartbeat);
    loop {
        match tokio::time::timeout(timeout, reader.recv()).await {
            Ok(Ok(Inbound::Heartbeat)) => {
                if let Err(e) = writer.write(key, Bytes::from_static(HEARTBEAT_REPLY)).await {
                    debug!(connection = %connection_id, error = %e, "Heartbeat reply failed");
                    break;
                }
            }
            Ok(Ok(Inbound::Data(data))) => {
                debug!(connection = %connection_id, len = data.len(), "Ignoring subscriber message");
            }
            Ok(Ok(Inbound::Closed)) => break,
            Ok(Err(e)) => {
                warn!(connection = %connection_id, error = %e, "Subscriber read failed");
                metrics::record_error("websocket");
                break;
            }
            Err(_) => {
                debug!(connection = %connection_id, ?timeout, "Subscriber heartbeat timed out");
                break;
            }
        }
    }

    if let Err(e) = channel.remove_conn(key, handle).await {
        error!(connection = %connection_id, key = %key, error = %e, "Failed to detach subscriber");
        metrics::record_error(e.kind());
    }
    let _ = writer.close().await;

    debug!(connection = %connection_id, key = %key, "Subscriber detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use futures_util::{SinkExt, StreamExt};
    use herald_core::{Authenticator, Channel, ChannelError, Message};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start(state: Arc<AppState>) -> std::net::SocketAddr {
        let listener = WebSocketListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_subscribers(listener, state));
        addr
    }

    async fn connect(addr: std::net::SocketAddr, query: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/sub?{}", addr, query))
            .await
            .unwrap();
        ws
    }

    async fn next_text(ws: &mut Client) -> String {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            WsMessage::Text(text) => text,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    async fn wait_for_count(channel: &Channel, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.connection_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_receives_pushes() {
        let state = Arc::new(AppState::new(Config::default()));
        let addr = start(Arc::clone(&state)).await;

        let mut ws = connect(addr, "key=alice&ver=1.0&heartbeat=30").await;
        assert_eq!(next_text(&mut ws).await, "h");

        let channel = state.registry.get("alice").unwrap();
        wait_for_count(&channel, 1).await;

        let mut msg = Message::new(&br#"{"n":1}"#[..]);
        channel.push_msg("alice", &mut msg, 0).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(body["msg"]["n"], 1);
        assert_eq!(body["mid"], msg.id);

        ws.send(WsMessage::Text("h".into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, "h");

        ws.close(None).await.unwrap();
        wait_for_count(&channel, 0).await;
        assert_eq!(state.registry.stats().active_connections, 0);
    }

    #[tokio::test]
    async fn test_subscriber_limit_rejects_extra_connection() {
        let mut config = Config::default();
        config.limits.max_subscribers_per_channel = 1;
        let state = Arc::new(AppState::new(config));
        let addr = start(Arc::clone(&state)).await;

        let mut first = connect(addr, "key=alice").await;
        assert_eq!(next_text(&mut first).await, "h");

        let mut second = connect(addr, "key=alice").await;
        let closed = tokio::time::timeout(Duration::from_secs(5), second.next())
            .await
            .unwrap();
        assert!(matches!(closed, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));

        let channel = state.registry.get("alice").unwrap();
        assert_eq!(channel.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_token_is_not_attached() {
        struct DenyAll;

        impl Authenticator for DenyAll {
            fn add_token(&self, _key: &str, _token: &str) -> Result<(), ChannelError> {
                Ok(())
            }

            fn auth_token(&self, _key: &str, _token: &str) -> bool {
                false
            }
        }

        let state = Arc::new(AppState::new(Config::default()).with_authenticator(Arc::new(DenyAll)));
        let addr = start(Arc::clone(&state)).await;

        for key in ["alice", "bob", "carol"] {
            let mut ws = connect(addr, &format!("key={}&token=bad", key)).await;
            let closed = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap();
            assert!(matches!(closed, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));
        }

        assert_eq!(state.registry.conn_stats().added(), 0);
        assert_eq!(state.registry.stats().channel_count, 0);
        assert!(state.registry.get("alice").is_none());
    }

    #[tokio::test]
    async fn test_idle_client_does_not_block_other_subscribers() {
        let state = Arc::new(AppState::new(Config::default()));
        let addr = start(Arc::clone(&state)).await;

        // Opens TCP but never sends the upgrade request.
        let _idle = tokio::net::TcpStream::connect(addr).await.unwrap();

        let mut ws = tokio::time::timeout(Duration::from_secs(3), connect(addr, "key=bob"))
            .await
            .unwrap();
        assert_eq!(next_text(&mut ws).await, "h");

        let channel = state.registry.get("bob").unwrap();
        wait_for_count(&channel, 1).await;
    }

    #[tokio::test]
    async fn test_silent_subscriber_is_detached() {
        let mut config = Config::default();
        config.heartbeat.min_interval_secs = 1;
        let state = Arc::new(AppState::new(config));
        let addr = start(Arc::clone(&state)).await;

        let mut ws = connect(addr, "key=alice&heartbeat=1").await;
        assert_eq!(next_text(&mut ws).await, "h");

        let channel = state.registry.get("alice").unwrap();
        wait_for_count(&channel, 1).await;
        wait_for_count(&channel, 0).await;
    }
}
