//! WebRTC signaling envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote session description offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRtcOffer {
    pub sdp: String,
    pub player_id: String,
    pub game_id: String,
    pub session_id: String,
}

/// A remote session description answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRtcAnswer {
    pub sdp: String,
    pub player_id: String,
    pub game_id: String,
    pub session_id: String,
}

/// A trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub player_id: String,
    pub game_id: String,
    pub session_id: String,
}

/// Signal discriminant, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    /// Wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{type, payload}` unit exchanged over the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum SignalingEnvelope {
    Offer(WebRtcOffer),
    Answer(WebRtcAnswer),
    Candidate(IceCandidate),
}

impl SignalingEnvelope {
    /// Which variant this is.
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalingEnvelope::Offer(_) => SignalKind::Offer,
            SignalingEnvelope::Answer(_) => SignalKind::Answer,
            SignalingEnvelope::Candidate(_) => SignalKind::Candidate,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            SignalingEnvelope::Offer(o) => &o.session_id,
            SignalingEnvelope::Answer(a) => &a.session_id,
            SignalingEnvelope::Candidate(c) => &c.session_id,
        }
    }

    #[must_use]
    pub fn player_id(&self) -> &str {
        match self {
            SignalingEnvelope::Offer(o) => &o.player_id,
            SignalingEnvelope::Answer(a) => &a.player_id,
            SignalingEnvelope::Candidate(c) => &c.player_id,
        }
    }

    #[must_use]
    pub fn game_id(&self) -> &str {
        match self {
            SignalingEnvelope::Offer(o) => &o.game_id,
            SignalingEnvelope::Answer(a) => &a.game_id,
            SignalingEnvelope::Candidate(c) => &c.game_id,
        }
    }
}

/// Result of decoding a signal: either a known envelope or a `type` this
/// relay does not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Known(SignalingEnvelope),
    Unknown(String),
}
