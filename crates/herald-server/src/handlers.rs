//! HTTP push API for Herald server.
//!
//! Publishers push private messages to a subscriber key over HTTP; offline
//! subscribers fetch persisted messages the same way.
//!
//! | Method | Path | Query |
//! |--------|------|-------|
//! | POST | `/1/push/private` | `key`, `expire`, `gid` |
//! | GET | `/1/msg/get` | `key`, `mid` |
//! | POST | `/1/admin/close` | `key` |
//! | GET | `/1/stats` | |
//! | GET | `/health` | |
//!
//! Every reply is a JSON object whose `ret` field is `0` on success.

use crate::config::{Config, StoreKind};
use crate::metrics;
use crate::subscriber;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use herald_core::{
    Authenticator, ChannelError, ChannelRegistry, DisabledStore, MemoryStore, Message, MessageId,
    MessageStore, PersistenceError,
};
use herald_protocol::MAX_PAYLOAD_SIZE;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Reply codes carried in the `ret` field.
pub mod ret {
    pub const OK: u32 = 0;
    pub const NOT_FOUND: u32 = 65531;
    pub const PAYLOAD_TOO_LARGE: u32 = 65532;
    pub const STORE_ERR: u32 = 65533;
    pub const PARAM_ERR: u32 = 65534;
    pub const INTERNAL_ERR: u32 = 65535;
}

/// Shared server state.
pub struct AppState {
    /// Channels by subscriber key.
    pub registry: ChannelRegistry,
    /// Server configuration.
    pub config: Config,
    /// The in-process store, when configured, for periodic purging.
    memory_store: Option<Arc<MemoryStore>>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let (store, memory_store): (Arc<dyn MessageStore>, _) = match config.store.kind {
            StoreKind::Memory => {
                let store = Arc::new(MemoryStore::with_limit(config.store.max_messages_per_key));
                (store.clone(), Some(store))
            }
            StoreKind::Disabled => (Arc::new(DisabledStore), None),
        };

        Self {
            registry: ChannelRegistry::new(config.channel_config(), store),
            config,
            memory_store,
        }
    }

    /// Use `auth` for subscriber tokens.
    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.registry = self.registry.with_authenticator(auth);
        self
    }
}

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A required query parameter is missing or empty.
    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    /// The request body exceeds the payload limit.
    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    /// No channel exists for the key.
    #[error("No channel for key")]
    NotFound,

    /// A channel operation failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A store operation failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl ApiError {
    fn status_and_ret(&self) -> (StatusCode, u32) {
        match self {
            ApiError::MissingParam(_) => (StatusCode::BAD_REQUEST, ret::PARAM_ERR),
            ApiError::PayloadTooLarge(..) => (StatusCode::PAYLOAD_TOO_LARGE, ret::PAYLOAD_TOO_LARGE),
            ApiError::NotFound => (StatusCode::NOT_FOUND, ret::NOT_FOUND),
            ApiError::Channel(ChannelError::InvalidKey(_) | ChannelError::Encode(_)) => {
                (StatusCode::BAD_REQUEST, ret::PARAM_ERR)
            }
            ApiError::Channel(ChannelError::Persistence(_)) | ApiError::Persistence(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, ret::STORE_ERR)
            }
            ApiError::Channel(_) => (StatusCode::INTERNAL_SERVER_ERROR, ret::INTERNAL_ERR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_ret();
        (status, Json(json!({ "ret": code, "msg": self.to_string() }))).into_response()
    }
}

/// Build the HTTP API router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/1/push/private", post(push_private_handler))
        .route("/1/msg/get", get(get_messages_handler))
        .route("/1/admin/close", post(close_handler))
        .route("/1/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP API and the subscriber endpoint.
///
/// # Errors
///
/// Returns an error if either endpoint fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            error!(error = %e, "Failed to start metrics exporter");
        }
        metrics::init_metrics();
    }

    if let Some(store) = state.memory_store.clone() {
        let interval = Duration::from_secs(config.store.purge_interval_secs.max(1));
        tokio::spawn(purge_loop(store, interval));
    }

    let subscribers = tokio::spawn(subscriber::run_subscriber_listener(Arc::clone(&state)));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Herald push API listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                result = subscribers => match result {
                    Ok(Err(e)) => error!(error = %e, "Subscriber endpoint failed"),
                    Ok(Ok(())) => warn!("Subscriber endpoint stopped"),
                    Err(e) => error!(error = %e, "Subscriber endpoint panicked"),
                },
            }
        })
        .await?;

    shutdown_state.registry.close_all().await;
    info!("Herald server stopped");

    Ok(())
}

async fn purge_loop(store: Arc<MemoryStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        store.purge_expired();
    }
}

#[derive(Debug, Deserialize)]
struct PushParams {
    #[serde(default)]
    key: String,
    #[serde(default)]
    expire: u32,
    #[serde(default)]
    gid: u32,
}

#[derive(Debug, Deserialize)]
struct GetParams {
    #[serde(default)]
    key: String,
    #[serde(default)]
    mid: MessageId,
}

#[derive(Debug, Deserialize)]
struct KeyParams {
    #[serde(default)]
    key: String,
}

fn require_key(key: &str) -> Result<&str, ApiError> {
    if key.is_empty() {
        return Err(ApiError::MissingParam("key"));
    }
    Ok(key)
}

/// Push a private message to every connection of a key.
async fn push_private_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PushParams>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let key = require_key(&params.key)?;
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(ApiError::PayloadTooLarge(body.len(), MAX_PAYLOAD_SIZE));
    }

    let start = Instant::now();
    let size = body.len();
    let channel = state.registry.get_or_create(key)?;
    metrics::set_active_channels(state.registry.stats().channel_count);

    let mut message = Message::new(body).with_group(params.gid);
    let result = channel.push_msg(key, &mut message, params.expire).await;

    let elapsed = start.elapsed().as_secs_f64();
    match result {
        Ok(()) => {
            metrics::record_push(size, "ok", elapsed);
            debug!(key = %key, mid = message.id, expire = params.expire, "Pushed private message");
            Ok(Json(json!({ "ret": ret::OK, "mid": message.id })))
        }
        Err(e) => {
            metrics::record_push(size, e.kind(), elapsed);
            metrics::record_error(e.kind());
            warn!(key = %key, error = %e, "Private push failed");
            Err(e.into())
        }
    }
}

/// Fetch the persisted messages of a key newer than `mid`.
async fn get_messages_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GetParams>,
) -> Result<Json<Value>, ApiError> {
    let key = require_key(&params.key)?;
    let messages = state
        .registry
        .store()
        .get_private_messages(key, params.mid)
        .await
        .map_err(|e| {
            metrics::record_error("persistence");
            ApiError::from(e)
        })?;

    let msgs: Vec<Value> = messages
        .into_iter()
        .map(|m| {
            let msg = serde_json::from_slice::<Value>(&m.payload)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&m.payload).into_owned()));
            json!({ "msg": msg, "mid": m.id })
        })
        .collect();

    Ok(Json(json!({ "ret": ret::OK, "msgs": msgs })))
}

/// Close a key's channel and every connection on it.
async fn close_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KeyParams>,
) -> Result<Json<Value>, ApiError> {
    let key = require_key(&params.key)?;
    if !state.registry.close(key).await {
        return Err(ApiError::NotFound);
    }
    metrics::set_active_channels(state.registry.stats().channel_count);
    info!(key = %key, "Closed channel by admin request");
    Ok(Json(json!({ "ret": ret::OK })))
}

/// Registry statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stats = state.registry.stats();
    Json(json!({
        "ret": ret::OK,
        "channels": stats.channel_count,
        "connections": {
            "active": stats.active_connections,
            "added": stats.connections_added,
            "removed": stats.connections_removed,
        },
    }))
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
