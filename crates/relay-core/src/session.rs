//! Peer sessions and their negotiation state.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::MutexGuard;
use tracing::{debug, warn};

use crate::peer::{DataChannel, PeerConnection, PeerError};

/// Where a session is in the offer/answer exchange.
///
/// The exchange moves one step at a time:
/// `Created -> OfferReceived -> AnswerPending -> Connected`. An ICE restart
/// enters `Restarting` from `Connected`, or from `AnswerPending` when the
/// first connectivity check fails, and leaves it for `Connected`. Any live
/// state may close; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Created,
    OfferReceived,
    AnswerPending,
    Connected,
    Restarting,
    Closed,
}

impl NegotiationState {
    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, OfferReceived)
            | (OfferReceived, AnswerPending)
            | (AnswerPending, Connected)
            | (AnswerPending | Connected, Restarting)
            | (Restarting, Connected) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::Created => "created",
            NegotiationState::OfferReceived => "offer_received",
            NegotiationState::AnswerPending => "answer_pending",
            NegotiationState::Connected => "connected",
            NegotiationState::Restarting => "restarting",
            NegotiationState::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote input already applied to the peer connection.
#[derive(Default)]
struct Applied {
    candidates: HashSet<String>,
    answer: Option<String>,
}

/// One negotiated peer connection, keyed by `session_id`.
pub struct PeerSession {
    session_id: String,
    player_id: String,
    game_id: String,
    state: Mutex<NegotiationState>,
    peer: Arc<dyn PeerConnection>,
    data_channel: RwLock<Option<Arc<dyn DataChannel>>>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    restart_attempted: AtomicBool,
    closed: AtomicBool,
    applied: Mutex<Applied>,
    /// Serializes negotiation steps on this session.
    op_lock: tokio::sync::Mutex<()>,
}

impl PeerSession {
    /// Create a session in the `Created` state.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        player_id: impl Into<String>,
        game_id: impl Into<String>,
        peer: Arc<dyn PeerConnection>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            player_id: player_id.into(),
            game_id: game_id.into(),
            state: Mutex::new(NegotiationState::Created),
            peer,
            data_channel: RwLock::new(None),
            created_at: now,
            last_activity: Mutex::new(now),
            restart_attempted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            applied: Mutex::new(Applied::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    #[must_use]
    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Record activity on the session.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    #[must_use]
    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    /// Move to `next`.
    ///
    /// Returns `false` if the move is not allowed; the state is left as is.
    /// Moving to the current state is a no-op that returns `true`.
    pub fn transition(&self, next: NegotiationState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return true;
        }
        if !state.can_transition_to(next) {
            warn!(
                session = %self.session_id,
                from = %*state,
                to = %next,
                "Rejected state transition"
            );
            return false;
        }
        debug!(session = %self.session_id, from = %*state, to = %next, "State transition");
        *state = next;
        true
    }

    /// The underlying peer connection.
    #[must_use]
    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    #[must_use]
    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.read().clone()
    }

    pub fn set_data_channel(&self, channel: Arc<dyn DataChannel>) {
        *self.data_channel.write() = Some(channel);
    }

    /// Detach the data channel.
    pub fn take_data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.data_channel.write().take()
    }

    /// Check if the session has a data channel ready to send.
    #[must_use]
    pub fn has_open_channel(&self) -> bool {
        self.data_channel
            .read()
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    /// Send over the data channel.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no open channel or the send fails.
    pub async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        let channel = self
            .data_channel()
            .filter(|channel| channel.is_open())
            .ok_or_else(|| PeerError::DataChannel("no open data channel".into()))?;
        channel.send(data).await
    }

    /// Claim the single automatic restart.
    ///
    /// Returns `true` only for the first caller.
    pub fn try_restart(&self) -> bool {
        !self.restart_attempted.swap(true, Ordering::AcqRel)
    }

    /// Wait for exclusive access to negotiation steps.
    pub async fn lock_ops(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    #[must_use]
    pub fn candidate_applied(&self, candidate: &str) -> bool {
        self.applied.lock().candidates.contains(candidate)
    }

    pub fn mark_candidate_applied(&self, candidate: impl Into<String>) {
        self.applied.lock().candidates.insert(candidate.into());
    }

    #[must_use]
    pub fn answer_applied(&self, sdp: &str) -> bool {
        self.applied.lock().answer.as_deref() == Some(sdp)
    }

    pub fn mark_answer_applied(&self, sdp: impl Into<String>) {
        self.applied.lock().answer = Some(sdp.into());
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the data channel and the peer connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transition(NegotiationState::Closed);

        if let Some(channel) = self.take_data_channel() {
            if let Err(e) = channel.close().await {
                debug!(session = %self.session_id, error = %e, "Data channel close failed");
            }
        }
        if let Err(e) = self.peer.close().await {
            warn!(session = %self.session_id, error = %e, "Peer connection close failed");
        }
        debug!(session = %self.session_id, "Session closed");
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("session_id", &self.session_id)
            .field("player_id", &self.player_id)
            .field("game_id", &self.game_id)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}
