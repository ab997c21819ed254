//! # relay-core
//!
//! Session lifecycle and peer negotiation for the signal relay.
//!
//! - **CandidateFilter** - drops non-routable ICE candidates before relay
//! - **SessionRegistry** - concurrent `session_id -> PeerSession` store
//! - **NegotiationEngine** - offer/answer/candidate state machine per session
//! - **SignalDispatcher** - broker handler decoding signals into engine calls
//! - **BroadcastRouter** - fan-out of game state over session data channels
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌───────────────────┐
//! │   Broker    │────▶│ SignalDispatcher │────▶│ NegotiationEngine │
//! └─────────────┘     └──────────────────┘     └───────────────────┘
//!        ▲                                               │
//!        │ answers, candidates                           ▼
//!        └────────────────────────────────────  ┌─────────────────┐
//!                                               │ SessionRegistry │
//!                                               └─────────────────┘
//!                                                        │
//!                                                        ▼
//!                                               ┌─────────────────┐
//!                                               │ BroadcastRouter │
//!                                               └─────────────────┘
//! ```
//!
//! The peer-connection capability sits behind the traits in [`peer`]; the
//! `webrtc` feature (on by default) provides an implementation on the
//! `webrtc` crate.

pub mod broadcast;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod peer;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::{spawn_snapshot_ticker, BroadcastRouter};
pub use dispatcher::SignalDispatcher;
pub use engine::{EngineConfig, NegotiationEngine};
pub use error::RelayError;
pub use filter::CandidateFilter;
pub use peer::{
    ConnectionState, DataChannel, LocalCandidate, PeerConnection, PeerConnector, PeerError,
    PeerObserver, RemoteCandidate, SessionDescription, SdpKind,
};
pub use registry::SessionRegistry;
pub use session::{NegotiationState, PeerSession};

#[cfg(feature = "webrtc")]
pub use peer::webrtc::{IceServer, RtcConfig, WebRtcConnector};
