//! Encoders and decoders for Herald messages.
//!
//! Both encodings are JSON documents. The legacy encoding carries the payload
//! as a string; the current encoding embeds it as a raw JSON value and adds
//! the message group.

use bytes::Bytes;
use serde_json::value::RawValue;
use std::borrow::Cow;
use thiserror::Error;

use crate::frames::{CurrentBody, LegacyBody, PushFrame};
use crate::version::ProtocolVersion;

/// Maximum payload size (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Heartbeat sent by clients.
pub const HEARTBEAT: &[u8] = b"h";

/// Heartbeat acknowledgment written by the server.
pub const HEARTBEAT_REPLY: &[u8] = b"h";

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload exceeds maximum size.
    #[error("Payload size {0} exceeds maximum {MAX_PAYLOAD_SIZE}")]
    PayloadTooLarge(usize),

    /// Payload is not valid UTF-8 and cannot be carried as a legacy string.
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Payload is not a JSON document and cannot be embedded.
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn check_size(frame: &PushFrame) -> Result<(), ProtocolError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(frame.payload.len()));
    }
    Ok(())
}

/// Encode a frame for legacy clients.
///
/// # Errors
///
/// Returns an error if the payload is too large or not UTF-8.
pub fn encode_legacy(frame: &PushFrame) -> Result<Bytes, ProtocolError> {
    check_size(frame)?;
    let text = std::str::from_utf8(&frame.payload)?;
    let body = LegacyBody {
        msg: Cow::Borrowed(text),
        expire: frame.expire,
        mid: frame.id,
    };
    Ok(Bytes::from(serde_json::to_vec(&body)?))
}

/// Encode a frame for current clients.
///
/// # Errors
///
/// Returns an error if the payload is too large or not a JSON document.
pub fn encode_current(frame: &PushFrame) -> Result<Bytes, ProtocolError> {
    check_size(frame)?;
    let msg: &RawValue =
        serde_json::from_slice(&frame.payload).map_err(ProtocolError::InvalidJson)?;
    let body = CurrentBody {
        msg,
        mid: frame.id,
        gid: frame.group_id,
    };
    Ok(Bytes::from(serde_json::to_vec(&body)?))
}

/// Encode a frame for the given protocol version.
///
/// # Errors
///
/// Returns an error if the payload cannot be carried by that encoding.
pub fn encode(frame: &PushFrame, version: ProtocolVersion) -> Result<Bytes, ProtocolError> {
    match version {
        ProtocolVersion::Legacy => encode_legacy(frame),
        ProtocolVersion::Current => encode_current(frame),
    }
}

/// Decode a legacy-encoded message.
///
/// # Errors
///
/// Returns an error if the data is not a legacy message body.
pub fn decode_legacy(data: &[u8]) -> Result<PushFrame, ProtocolError> {
    let body: LegacyBody<'_> = serde_json::from_slice(data)?;
    Ok(PushFrame::new(body.mid, Bytes::from(body.msg.into_owned())).with_expire(body.expire))
}

/// Decode a current-encoded message.
///
/// # Errors
///
/// Returns an error if the data is not a current message body.
pub fn decode_current(data: &[u8]) -> Result<PushFrame, ProtocolError> {
    let body: CurrentBody<'_> = serde_json::from_slice(data)?;
    Ok(
        PushFrame::new(body.mid, Bytes::copy_from_slice(body.msg.get().as_bytes()))
            .with_group(body.gid),
    )
}

/// Check whether inbound data is a client heartbeat.
#[must_use]
pub fn is_heartbeat(data: &[u8]) -> bool {
    data == HEARTBEAT
}
