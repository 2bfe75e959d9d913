//! Protocol version tags for Herald.
//!
//! Every subscriber announces a version tag when it connects. Clients that
//! predate the tag send nothing and are served the legacy encoding.

use std::fmt;

/// Version tag advertised by current clients.
pub const CURRENT_VERSION_TAG: &str = "1.0";

/// The encoding a connection expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Pre-versioning clients: flat message body with the payload as a string.
    Legacy,
    /// Versioned clients: message envelope with the payload embedded as JSON.
    Current,
}

impl ProtocolVersion {
    /// Resolve a connection's version tag.
    ///
    /// An empty tag selects the legacy protocol; any other tag selects the
    /// current one.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        if tag.is_empty() {
            ProtocolVersion::Legacy
        } else {
            ProtocolVersion::Current
        }
    }

    /// Whether this is the legacy protocol.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        matches!(self, ProtocolVersion::Legacy)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Legacy => f.write_str("legacy"),
            ProtocolVersion::Current => f.write_str("current"),
        }
    }
}
