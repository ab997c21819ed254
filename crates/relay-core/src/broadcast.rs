//! Data-channel fan-out.
//!
//! Sends go over each session's data channel. Delivery is best effort: a
//! failed send is logged and the broadcast continues.

use bytes::Bytes;
use relay_protocol::{codec, GameState, PlayerState};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::RelayError;
use crate::registry::SessionRegistry;

/// Routes payloads to sessions by game or player.
pub struct BroadcastRouter {
    registry: Arc<SessionRegistry>,
}

impl BroadcastRouter {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `payload` to every session of `game_id` with an open data channel.
    pub async fn broadcast_to_game(&self, game_id: &str, payload: Bytes) {
        let targets = self
            .registry
            .select(|session| session.game_id() == game_id && session.has_open_channel());

        let mut delivered = 0usize;
        for session in &targets {
            match session.send(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    session = %session.session_id(),
                    game = %game_id,
                    error = %e,
                    "Broadcast send failed"
                ),
            }
        }

        trace!(game = %game_id, targets = targets.len(), delivered, "Broadcast complete");
    }

    /// Send `payload` to the first session of `player_id` with an open data channel.
    ///
    /// # Errors
    ///
    /// Returns `PlayerNotFound` if no such session exists, or the send error.
    pub async fn send_to_player(&self, player_id: &str, payload: Bytes) -> Result<(), RelayError> {
        let session = self
            .registry
            .select(|session| session.player_id() == player_id && session.has_open_channel())
            .into_iter()
            .next()
            .ok_or_else(|| RelayError::PlayerNotFound(player_id.to_string()))?;

        session.send(payload).await?;
        Ok(())
    }

    /// Current state of `game_id`.
    #[must_use]
    pub fn snapshot(&self, game_id: &str, tick: u64) -> GameState {
        let mut state = GameState::new(game_id, tick);
        state.players = self
            .registry
            .select(|session| session.game_id() == game_id)
            .iter()
            .map(|session| PlayerState {
                player_id: session.player_id().to_string(),
                session_id: session.session_id().to_string(),
                state: session.state().as_str().to_string(),
            })
            .collect();
        state.players.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        state
    }

    /// Broadcast a snapshot of every game with registered sessions.
    pub async fn broadcast_snapshots(&self, tick: u64) {
        for game_id in self.registry.game_ids() {
            let snapshot = self.snapshot(&game_id, tick);
            match codec::encode(&snapshot) {
                Ok(json) => self.broadcast_to_game(&game_id, Bytes::from(json)).await,
                Err(e) => error!(game = %game_id, error = %e, "Failed to encode snapshot"),
            }
        }
    }
}

/// Broadcast snapshots every `interval` until `cancel` fires.
pub fn spawn_snapshot_ticker(
    router: Arc<BroadcastRouter>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tick += 1;
                    router.broadcast_snapshots(tick).await;
                }
            }
        }

        debug!(ticks = tick, "Snapshot ticker stopped");
    })
}
