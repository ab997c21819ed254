//! Offer/answer/candidate negotiation.
//!
//! One [`NegotiationEngine`] serves every session. Each session gets a
//! [`SessionObserver`] that turns peer events into publishes and registry
//! updates. The observer holds weak references only, so a closed session and
//! its peer connection can be dropped even while the stack still holds the
//! observer.

use bytes::Bytes;
use relay_broker::Producer;
use relay_protocol::{
    codec, IceCandidate, SignalingEnvelope, TransportMessage, WebRtcAnswer, WebRtcOffer,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayError;
use crate::filter::CandidateFilter;
use crate::peer::{
    ConnectionState, DataChannel, LocalCandidate, PeerConnector, PeerObserver, RemoteCandidate,
    SessionDescription,
};
use crate::registry::SessionRegistry;
use crate::session::{NegotiationState, PeerSession};

/// Negotiation engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Topic receiving answers, candidates and restart offers.
    pub response_topic: String,
    /// Upper bound on waiting for local candidate gathering.
    pub gathering_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_topic: "rtc-response-topic".to_string(),
            gathering_timeout: Duration::from_secs(30),
        }
    }
}

struct EngineShared {
    connector: Arc<dyn PeerConnector>,
    registry: Arc<SessionRegistry>,
    producer: Arc<dyn Producer>,
    filter: CandidateFilter,
    config: EngineConfig,
    cancel: CancellationToken,
}

/// Drives the WebRTC negotiation of every session.
#[derive(Clone)]
pub struct NegotiationEngine {
    shared: Arc<EngineShared>,
}

impl NegotiationEngine {
    /// Create an engine.
    ///
    /// `cancel` aborts pending gathering waits on shutdown.
    #[must_use]
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        registry: Arc<SessionRegistry>,
        producer: Arc<dyn Producer>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                connector,
                registry,
                producer,
                filter: CandidateFilter::new(),
                config,
                cancel,
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }

    /// Accept an offer: create the session, answer it and publish the answer.
    ///
    /// A session registered under the same id is closed and replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if any setup step or the answer publish fails; the
    /// new session is then closed and removed.
    pub async fn handle_offer(&self, offer: WebRtcOffer) -> Result<(), RelayError> {
        let shared = &self.shared;
        let peer = shared.connector.create().await?;
        let session = Arc::new(PeerSession::new(
            offer.session_id.as_str(),
            offer.player_id.as_str(),
            offer.game_id.as_str(),
            peer.clone(),
        ));

        shared.registry.put(session.clone()).await;

        let gathered = Arc::new(Notify::new());
        peer.set_observer(Arc::new(SessionObserver {
            engine: Arc::downgrade(shared),
            session: Arc::downgrade(&session),
            gathered: gathered.clone(),
        }));

        match shared.answer(&session, offer.sdp, &gathered).await {
            Ok(()) => {
                info!(
                    session = %offer.session_id,
                    player = %offer.player_id,
                    game = %offer.game_id,
                    "Answer published"
                );
                Ok(())
            }
            Err(e) => {
                warn!(session = %offer.session_id, error = %e, "Offer failed, discarding session");
                shared.discard(&session).await;
                Err(e)
            }
        }
    }

    /// Apply a remote answer to an existing session.
    ///
    /// An answer identical to the last applied one is ignored.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown session, or the peer error.
    pub async fn handle_answer(&self, answer: WebRtcAnswer) -> Result<(), RelayError> {
        let session = self.lookup(&answer.session_id)?;
        let _ops = session.lock_ops().await;

        if session.answer_applied(&answer.sdp) {
            debug!(session = %answer.session_id, "Duplicate answer ignored");
            return Ok(());
        }

        session
            .peer()
            .set_remote_description(SessionDescription::answer(answer.sdp.as_str()))
            .await?;
        session.mark_answer_applied(answer.sdp);
        session.touch();

        debug!(session = %answer.session_id, "Remote answer applied");
        Ok(())
    }

    /// Add a remote ICE candidate to an existing session.
    ///
    /// A candidate already applied to the session is ignored.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown session, or the peer error.
    pub async fn handle_candidate(&self, candidate: IceCandidate) -> Result<(), RelayError> {
        let session = self.lookup(&candidate.session_id)?;
        let _ops = session.lock_ops().await;

        if session.candidate_applied(&candidate.candidate) {
            debug!(session = %candidate.session_id, "Duplicate candidate ignored");
            return Ok(());
        }

        session
            .peer()
            .add_ice_candidate(RemoteCandidate {
                candidate: candidate.candidate.clone(),
            })
            .await?;
        session.mark_candidate_applied(candidate.candidate);
        session.touch();

        debug!(session = %candidate.session_id, "Remote candidate added");
        Ok(())
    }

    /// Close and remove every session.
    pub async fn shutdown(&self) {
        let sessions = self.shared.registry.drain();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        info!(sessions = count, "Negotiation engine shut down");
    }

    fn lookup(&self, session_id: &str) -> Result<Arc<PeerSession>, RelayError> {
        self.shared
            .registry
            .get(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }
}

impl EngineShared {
    async fn answer(
        &self,
        session: &Arc<PeerSession>,
        sdp: String,
        gathered: &Notify,
    ) -> Result<(), RelayError> {
        let answer = {
            let _ops = session.lock_ops().await;
            let peer = session.peer();

            peer.set_remote_description(SessionDescription::offer(sdp)).await?;
            session.transition(NegotiationState::OfferReceived);

            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            session.transition(NegotiationState::AnswerPending);
            answer
        };

        tokio::select! {
            _ = gathered.notified() => {
                debug!(session = %session.session_id(), "Candidate gathering complete");
            }
            _ = tokio::time::sleep(self.config.gathering_timeout) => {
                warn!(
                    session = %session.session_id(),
                    timeout_ms = self.config.gathering_timeout.as_millis() as u64,
                    "Candidate gathering timed out, answering with what was gathered"
                );
            }
            _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
        }

        let gathered = session
            .peer()
            .local_description()
            .await
            .map_or(answer.sdp, |description| description.sdp);
        let sdp = self.filter.scrub_sdp(&gathered);

        self.publish(
            session,
            SignalingEnvelope::Answer(WebRtcAnswer {
                sdp,
                player_id: session.player_id().to_string(),
                game_id: session.game_id().to_string(),
                session_id: session.session_id().to_string(),
            }),
        )
        .await
    }

    /// Publish `envelope` to the response topic, addressed to the session's player.
    async fn publish(
        &self,
        session: &PeerSession,
        envelope: SignalingEnvelope,
    ) -> Result<(), RelayError> {
        let kind = envelope.kind();
        let message = TransportMessage::signal(session.player_id(), session.game_id(), &envelope)?;
        let body = codec::encode(&message)?;

        self.producer
            .send(
                &self.config.response_topic,
                Some(session.session_id()),
                body.as_bytes(),
            )
            .await?;

        debug!(session = %session.session_id(), kind = %kind, "Signal published");
        Ok(())
    }

    async fn publish_candidate(&self, session: &PeerSession, candidate: LocalCandidate) {
        if session.is_closed() {
            debug!(session = %session.session_id(), "Session closed, dropping candidate");
            return;
        }
        if !self.filter.allows(&candidate.candidate) {
            debug!(
                session = %session.session_id(),
                candidate = %candidate.candidate,
                "Dropping non-routable candidate"
            );
            return;
        }

        let envelope = SignalingEnvelope::Candidate(IceCandidate {
            candidate: candidate.candidate,
            player_id: session.player_id().to_string(),
            game_id: session.game_id().to_string(),
            session_id: session.session_id().to_string(),
        });
        if let Err(e) = self.publish(session, envelope).await {
            error!(session = %session.session_id(), error = %e, "Failed to publish candidate");
        }
    }

    /// One ICE restart per session; a second failure ends the session.
    async fn recover(&self, session: Arc<PeerSession>) {
        if session.is_closed() {
            return;
        }
        if !session.try_restart() {
            warn!(session = %session.session_id(), "Connection failed after restart, closing");
            self.discard(&session).await;
            return;
        }

        if !session.transition(NegotiationState::Restarting) {
            warn!(
                session = %session.session_id(),
                state = %session.state(),
                "Connection failed before negotiation finished, closing"
            );
            self.discard(&session).await;
            return;
        }
        match self.restart(&session).await {
            Ok(()) => info!(session = %session.session_id(), "ICE restart offer published"),
            Err(e) => {
                error!(session = %session.session_id(), error = %e, "ICE restart failed, closing");
                self.discard(&session).await;
            }
        }
    }

    async fn restart(&self, session: &PeerSession) -> Result<(), RelayError> {
        let offer = {
            let _ops = session.lock_ops().await;
            let offer = session.peer().create_offer(true).await?;
            session.peer().set_local_description(offer.clone()).await?;
            offer
        };

        self.publish(
            session,
            SignalingEnvelope::Offer(WebRtcOffer {
                sdp: offer.sdp,
                player_id: session.player_id().to_string(),
                game_id: session.game_id().to_string(),
                session_id: session.session_id().to_string(),
            }),
        )
        .await
    }

    /// Remove `session` if still registered and close it.
    async fn discard(&self, session: &Arc<PeerSession>) {
        if self.registry.delete_if_current(session) {
            debug!(session = %session.session_id(), "Session removed");
        }
        session.close().await;
    }
}

/// Per-session peer event handler.
struct SessionObserver {
    engine: Weak<EngineShared>,
    session: Weak<PeerSession>,
    gathered: Arc<Notify>,
}

impl SessionObserver {
    fn upgrade(&self) -> Option<(Arc<EngineShared>, Arc<PeerSession>)> {
        Some((self.engine.upgrade()?, self.session.upgrade()?))
    }
}

impl PeerObserver for SessionObserver {
    fn on_ice_candidate(&self, candidate: Option<LocalCandidate>) {
        let Some(candidate) = candidate else {
            self.gathered.notify_one();
            return;
        };
        let Some((engine, session)) = self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            engine.publish_candidate(&session, candidate).await;
        });
    }

    fn on_connection_state_change(&self, state: ConnectionState) {
        let Some((engine, session)) = self.upgrade() else {
            return;
        };
        info!(session = %session.session_id(), state = %state, "Peer connection state changed");

        match state {
            ConnectionState::Connected => {
                session.transition(NegotiationState::Connected);
                session.touch();
            }
            ConnectionState::Failed => {
                tokio::spawn(async move { engine.recover(session).await });
            }
            ConnectionState::Closed => {
                tokio::spawn(async move { engine.discard(&session).await });
            }
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
    }

    fn on_data_channel(&self, channel: Arc<dyn DataChannel>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        info!(session = %session.session_id(), label = %channel.label(), "Data channel attached");
        session.set_data_channel(channel);
    }

    fn on_data_channel_open(&self, label: &str) {
        if let Some(session) = self.session.upgrade() {
            info!(session = %session.session_id(), label = %label, "Data channel open");
            session.touch();
        }
    }

    fn on_data_channel_message(&self, label: &str, data: Bytes) {
        if let Some(session) = self.session.upgrade() {
            debug!(
                session = %session.session_id(),
                label = %label,
                bytes = data.len(),
                "Data channel message"
            );
            session.touch();
        }
    }

    fn on_data_channel_close(&self, label: &str) {
        let Some((engine, session)) = self.upgrade() else {
            return;
        };
        info!(session = %session.session_id(), label = %label, "Data channel closed");
        session.take_data_channel();
        tokio::spawn(async move { engine.discard(&session).await });
    }

    fn on_data_channel_error(&self, label: &str, error: &str) {
        if let Some(session) = self.session.upgrade() {
            warn!(session = %session.session_id(), label = %label, error = %error, "Data channel error");
        }
    }
}
