//! Relay error taxonomy.

use crate::peer::PeerError;
use relay_broker::BrokerError;
use relay_protocol::ProtocolError;
use thiserror::Error;

/// Errors returned by the negotiation engine and the broadcast router.
#[derive(Debug, Error)]
pub enum RelayError {
    /// An answer or candidate referenced a session that is not registered.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// No session with an open data channel belongs to the player.
    #[error("Player not found: {0}")]
    PlayerNotFound(String),

    /// SDP or ICE setup failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] PeerError),

    /// Publishing to the broker failed after retries.
    #[error("Publish failed: {0}")]
    Publish(#[from] BrokerError),

    /// A payload could not be encoded or decoded.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] ProtocolError),

    /// Shutdown interrupted the operation.
    #[error("Operation cancelled")]
    Cancelled,
}
