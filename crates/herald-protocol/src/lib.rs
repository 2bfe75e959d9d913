//! # herald-protocol
//!
//! Wire encodings for the Herald push delivery core.
//!
//! Every push is serialized in one of two shapes, chosen per connection by
//! its protocol-version tag:
//!
//! - **Legacy** - `{"msg": "<payload text>", "expire": .., "mid": ..}`
//! - **Current** - `{"msg": <payload JSON>, "mid": .., "gid": ..}`
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, PushFrame, ProtocolVersion};
//!
//! let frame = PushFrame::new(1, &br#"{"title":"hello"}"#[..]);
//!
//! let legacy = codec::encode(&frame, ProtocolVersion::from_tag("")).unwrap();
//! let current = codec::encode(&frame, ProtocolVersion::from_tag("1.0")).unwrap();
//! assert_ne!(legacy, current);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{
    decode_current, decode_legacy, encode, encode_current, encode_legacy, ProtocolError,
    HEARTBEAT, HEARTBEAT_REPLY, MAX_PAYLOAD_SIZE,
};
pub use frames::PushFrame;
pub use version::{ProtocolVersion, CURRENT_VERSION_TAG};
