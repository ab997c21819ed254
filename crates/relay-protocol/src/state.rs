//! Game state snapshots broadcast over data channels.

use serde::{Deserialize, Serialize};

/// A player entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub player_id: String,
    pub session_id: String,
    /// Negotiation state of the player's session.
    pub state: String,
}

/// An object in the game world. Opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameObject {
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Periodic state of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub game_id: String,
    /// Monotonic tick counter of the broadcaster.
    pub tick: u64,
    pub players: Vec<PlayerState>,
    #[serde(default)]
    pub objects: Vec<GameObject>,
}

impl GameState {
    /// Create an empty snapshot for a game.
    #[must_use]
    pub fn new(game_id: impl Into<String>, tick: u64) -> Self {
        Self {
            game_id: game_id.into(),
            tick,
            players: Vec::new(),
            objects: Vec::new(),
        }
    }
}
