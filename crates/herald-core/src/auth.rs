//! Subscriber token authentication.
//!
//! Token issuance is not implemented yet, so the default policy admits every
//! subscriber. A real policy plugs in through [`Authenticator`].

use crate::error::ChannelError;

/// Token policy consulted by a channel.
pub trait Authenticator: Send + Sync {
    /// Register `token` for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Auth`] if the token cannot be registered.
    fn add_token(&self, key: &str, token: &str) -> Result<(), ChannelError>;

    /// Check whether `token` is valid for `key`.
    fn auth_token(&self, key: &str, token: &str) -> bool;
}

/// Admits every subscriber and accepts every token registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

impl Authenticator for PermitAll {
    fn add_token(&self, _key: &str, _token: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    fn auth_token(&self, _key: &str, _token: &str) -> bool {
        true
    }
}
