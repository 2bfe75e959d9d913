//! Connection counters shared by every channel.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide connection counters.
#[derive(Debug, Default)]
pub struct ConnStats {
    added: AtomicU64,
    removed: AtomicU64,
}

impl ConnStats {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attached connection.
    pub fn incr_add(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a detached connection.
    pub fn incr_remove(&self) {
        self.removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Connections attached since start.
    #[must_use]
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    /// Connections detached since start.
    #[must_use]
    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    /// Currently attached connections.
    #[must_use]
    pub fn active(&self) -> u64 {
        self.added().saturating_sub(self.removed())
    }
}
