//! Peer-connection capability.
//!
//! The engine never touches a WebRTC stack directly. It drives a
//! [`PeerConnection`] created by a [`PeerConnector`] and receives events
//! through a [`PeerObserver`], one method per event.

#[cfg(feature = "webrtc")]
pub mod webrtc;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Peer-connection errors.
#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer connection could not be created.
    #[error("Failed to create peer connection: {0}")]
    Create(String),

    /// The remote description was rejected.
    #[error("Failed to set remote description: {0}")]
    RemoteDescription(String),

    /// The local description was rejected.
    #[error("Failed to set local description: {0}")]
    LocalDescription(String),

    /// Generating an offer or answer failed.
    #[error("Failed to create {0}: {1}")]
    Generate(SdpKind, String),

    /// A remote ICE candidate was rejected.
    #[error("Failed to add ICE candidate: {0}")]
    Candidate(String),

    /// Data channel send or close failed.
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// Closing the connection failed.
    #[error("Failed to close peer connection: {0}")]
    Close(String),

    /// The connection is already closed.
    #[error("Peer connection closed")]
    Closed,
}

/// SDP type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => write!(f, "offer"),
            SdpKind::Answer => write!(f, "answer"),
        }
    }
}

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    /// An offer.
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// An answer.
    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate gathered by the local agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// An ICE candidate received from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub candidate: String,
}

/// Connection state as reported by the ICE/DTLS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a fresh peer connection.
    async fn create(&self) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Route this connection's events to `observer`, replacing any previous one.
    fn set_observer(&self, observer: Arc<dyn PeerObserver>);

    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an offer; `ice_restart` requests fresh ICE credentials.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Set the local description. Candidate gathering starts here.
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    /// Current local description, including gathered candidates.
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: RemoteCandidate) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// A data channel opened by the remote peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send(&self, data: Bytes) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Receives peer-connection events.
///
/// Called from the peer stack's own tasks; implementations must not block.
pub trait PeerObserver: Send + Sync {
    /// A local candidate was gathered; `None` marks the end of gathering.
    fn on_ice_candidate(&self, candidate: Option<LocalCandidate>);

    fn on_connection_state_change(&self, state: ConnectionState);

    /// The remote peer opened a data channel.
    fn on_data_channel(&self, channel: Arc<dyn DataChannel>);

    fn on_data_channel_open(&self, label: &str);

    fn on_data_channel_message(&self, label: &str, data: Bytes);

    fn on_data_channel_close(&self, label: &str);

    fn on_data_channel_error(&self, label: &str, error: &str);
}
