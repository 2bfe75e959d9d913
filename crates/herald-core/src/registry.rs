//! Channel registry for Herald.
//!
//! The registry maps subscriber keys to their channels. Channels are created
//! on first use and share the registry's limits, store, authenticator and
//! connection counters.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{Authenticator, PermitAll};
use crate::channel::{validate_key, Channel, ChannelConfig};
use crate::error::ChannelError;
use crate::stats::ConnStats;
use crate::store::MessageStore;

/// Registry of live channels.
pub struct ChannelRegistry {
    /// Channels indexed by subscriber key.
    channels: DashMap<String, Arc<Channel>>,
    config: ChannelConfig,
    store: Arc<dyn MessageStore>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<ConnStats>,
}

impl ChannelRegistry {
    /// Create a registry whose channels persist through `store`.
    #[must_use]
    pub fn new(config: ChannelConfig, store: Arc<dyn MessageStore>) -> Self {
        info!("Creating channel registry with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            config,
            store,
            auth: Arc::new(PermitAll),
            stats: Arc::new(ConnStats::new()),
        }
    }

    /// Use `auth` for every channel created from now on.
    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    /// Connection counters shared by all channels.
    #[must_use]
    pub fn conn_stats(&self) -> &Arc<ConnStats> {
        &self.stats
    }

    /// The message store shared by all channels.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// The authenticator shared by all channels.
    #[must_use]
    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.auth
    }

    /// Get the channel for `key`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidKey`] if the key is invalid.
    pub fn get_or_create(&self, key: &str) -> Result<Arc<Channel>, ChannelError> {
        if let Some(channel) = self.channels.get(key) {
            return Ok(Arc::clone(&channel));
        }
        validate_key(key).map_err(ChannelError::InvalidKey)?;

        let entry = self
            .channels
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, "Creating new channel");
                Arc::new(
                    Channel::new(self.config.clone(), Arc::clone(&self.store))
                        .with_authenticator(Arc::clone(&self.auth))
                        .with_stats(Arc::clone(&self.stats)),
                )
            });
        Ok(Arc::clone(&entry))
    }

    /// Get the channel for `key`, if it exists.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<Channel>> {
        self.channels.get(key).map(|c| Arc::clone(&c))
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }

    /// Remove the channel for `key` and close all its connections.
    ///
    /// Returns `false` if there was no such channel.
    pub async fn close(&self, key: &str) -> bool {
        let Some((_, channel)) = self.channels.remove(key) else {
            return false;
        };
        // Close errors are logged by the channel itself.
        let _ = channel.close().await;
        debug!(key = %key, "Closed channel");
        true
    }

    /// Remove and close every channel.
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for key in &keys {
            self.close(key).await;
        }
        info!(channels = keys.len(), "Closed all channels");
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            channel_count: self.channels.len(),
            active_connections: self.stats.active(),
            connections_added: self.stats.added(),
            connections_removed: self.stats.removed(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of channels.
    pub channel_count: usize,
    /// Currently attached connections.
    pub active_connections: u64,
    /// Connections attached since start.
    pub connections_added: u64,
    /// Connections detached since start.
    pub connections_removed: u64,
}
