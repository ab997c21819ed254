//! JSON codec for relay wire types.
//!
//! Decoding a signal is two-step: the `type` tag is read first so that an
//! unrecognised type can be reported as [`Signal::Unknown`] instead of a hard
//! decode error, then the payload is decoded into the matching variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::TransportMessage;
use crate::signal::{Signal, SignalKind, SignalingEnvelope};

/// Maximum encoded message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct RawSignal {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Encode any wire type to a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is too large.
pub fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let json = serde_json::to_string(value)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(json.len()));
    }
    Ok(json)
}

/// Decode a transport message.
///
/// # Errors
///
/// Returns an error if the data is too large or not a valid message.
pub fn decode_message(data: &[u8]) -> Result<TransportMessage, ProtocolError> {
    check_size(data)?;
    Ok(serde_json::from_slice(data)?)
}

/// Decode a signaling envelope.
///
/// # Errors
///
/// Returns an error if the data is too large, not JSON, has no `type`, or the
/// payload does not match a known type.
pub fn decode_signal(data: &[u8]) -> Result<Signal, ProtocolError> {
    check_size(data)?;
    let raw: RawSignal = serde_json::from_slice(data)?;

    let envelope = match SignalKind::from_wire(&raw.kind) {
        Some(SignalKind::Offer) => SignalingEnvelope::Offer(serde_json::from_value(raw.payload)?),
        Some(SignalKind::Answer) => SignalingEnvelope::Answer(serde_json::from_value(raw.payload)?),
        Some(SignalKind::Candidate) => {
            SignalingEnvelope::Candidate(serde_json::from_value(raw.payload)?)
        }
        None => return Ok(Signal::Unknown(raw.kind)),
    };

    Ok(Signal::Known(envelope))
}

fn check_size(data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }
    Ok(())
}
