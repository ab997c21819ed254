//! Transport messages.
//!
//! A [`TransportMessage`] is the JSON object a client writes to its socket. The
//! gateway validates it and forwards it to the broker topic selected by its
//! [`Action`]; responses travel back in the same shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::codec::{self, ProtocolError};
use crate::signal::{Signal, SignalingEnvelope};

/// What the gateway should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Chat traffic, routed to the message topic.
    Message,
    /// WebRTC signaling, routed to the signal topic.
    Webrtc,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Message => f.write_str("message"),
            Action::Webrtc => f.write_str("webrtc"),
        }
    }
}

/// Field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field was missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Broker-level wrapper around client traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Message id assigned by the producer.
    #[serde(default)]
    pub pid: String,
    /// Producer (client) id; the socket this message belongs to.
    #[serde(default)]
    pub producer: String,
    /// Raw payload. For `webrtc` actions this is a JSON signaling envelope.
    #[serde(default)]
    pub payload: String,
    /// Room or session grouping key.
    #[serde(default)]
    pub group: String,
    /// Creation time.
    #[serde(rename = "createdAt", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Routing action. A frame without one cannot be routed.
    pub action: Action,
}

impl TransportMessage {
    /// Create a new message with a fresh id.
    #[must_use]
    pub fn new(
        producer: impl Into<String>,
        group: impl Into<String>,
        action: Action,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            pid: uuid::Uuid::new_v4().to_string(),
            producer: producer.into(),
            payload: payload.into(),
            group: group.into(),
            created_at: Utc::now(),
            action,
        }
    }

    /// Wrap a signaling envelope addressed to `producer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded.
    pub fn signal(
        producer: impl Into<String>,
        group: impl Into<String>,
        envelope: &SignalingEnvelope,
    ) -> Result<Self, ProtocolError> {
        let payload = codec::encode(envelope)?;
        Ok(Self::new(producer, group, Action::Webrtc, payload))
    }

    /// Check the fields the gateway requires.
    ///
    /// # Errors
    ///
    /// Returns the first missing field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.producer.trim().is_empty() {
            return Err(ValidationError::MissingField("producer"));
        }
        if self.payload.is_empty() {
            return Err(ValidationError::MissingField("payload"));
        }
        if self.group.trim().is_empty() {
            return Err(ValidationError::MissingField("group"));
        }
        Ok(())
    }

    /// Key used to pick a broker partition.
    ///
    /// Signaling is keyed by session id so that every message of one
    /// negotiation lands on the same partition; everything else by group.
    #[must_use]
    pub fn partition_key(&self) -> String {
        if self.action == Action::Webrtc {
            if let Ok(Signal::Known(envelope)) = codec::decode_signal(self.payload.as_bytes()) {
                return envelope.session_id().to_string();
            }
        }
        self.group.clone()
    }
}
