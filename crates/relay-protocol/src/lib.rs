//! # relay-protocol
//!
//! Wire types exchanged between clients, the gateway and the broker.
//!
//! Everything on the wire is JSON:
//!
//! - [`TransportMessage`] - what a client writes to its socket and what the
//!   gateway puts on the broker
//! - [`SignalingEnvelope`] - the `{type, payload}` WebRTC signal carried in a
//!   transport message's `payload`
//! - [`GameState`] - the snapshot fanned out over data channels
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Signal, SignalingEnvelope, WebRtcOffer};
//!
//! let offer = SignalingEnvelope::Offer(WebRtcOffer {
//!     sdp: "v=0".into(),
//!     player_id: "p1".into(),
//!     game_id: "g1".into(),
//!     session_id: "s1".into(),
//! });
//!
//! let json = codec::encode(&offer).unwrap();
//! match codec::decode_signal(json.as_bytes()).unwrap() {
//!     Signal::Known(envelope) => assert_eq!(envelope.session_id(), "s1"),
//!     Signal::Unknown(kind) => panic!("unexpected signal type {kind}"),
//! }
//! ```

pub mod codec;
pub mod message;
pub mod signal;
pub mod state;

pub use codec::{decode_message, decode_signal, encode, ProtocolError};
pub use message::{Action, TransportMessage, ValidationError};
pub use signal::{IceCandidate, Signal, SignalKind, SignalingEnvelope, WebRtcAnswer, WebRtcOffer};
pub use state::{GameObject, GameState, PlayerState};
